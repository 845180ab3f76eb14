use std::env;
use std::fs;
use std::path::PathBuf;

/// Returns the root directory used for config and state files.
pub fn default_app_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".local").join("share")),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join("mirror-fetch")
}

pub fn config_path() -> PathBuf {
    default_app_dir().join("config.json")
}

/// Remembers the id of the last notice shown, so it is shown once.
pub fn seen_notice_path() -> PathBuf {
    default_app_dir().join("seen_notice")
}

/// The user's Downloads folder, or the working directory if there is no home.
pub fn default_downloads_dir() -> PathBuf {
    let home = match env::consts::OS {
        "windows" => env::var_os("USERPROFILE"),
        _ => env::var_os("HOME"),
    };
    home.map(|home| PathBuf::from(home).join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Create the on-disk folder layout.
pub fn ensure_base_dirs() -> std::io::Result<()> {
    fs::create_dir_all(default_app_dir())
}
