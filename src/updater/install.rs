use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::Error;

const CLEANUP_ATTEMPTS: u32 = 5;

fn old_binary_path(exe: &Path) -> PathBuf {
    let mut name = exe.as_os_str().to_owned();
    name.push(".old");
    PathBuf::from(name)
}

/// Swap a verified update artifact in place of the executable at `exe`.
///
/// The previous binary is kept as `<exe>.old` until the next start.
pub fn install_update(staged: &Path, exe: &Path) -> Result<(), Error> {
    let old = old_binary_path(exe);
    if old.exists() {
        let _ = fs::remove_file(&old);
    }

    fs::rename(exe, &old)
        .map_err(|e| Error::Install(format!("cannot move {} aside: {e}", exe.display())))?;

    if let Err(err) = move_file(staged, exe) {
        if let Err(restore) = fs::rename(&old, exe) {
            warn!(
                "update: failed to restore {} after aborted install: {restore}",
                exe.display()
            );
        }
        return Err(Error::Install(format!(
            "cannot move {} into place: {err}",
            staged.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(exe, fs::Permissions::from_mode(0o755))
            .map_err(|e| Error::Install(format!("cannot mark {} executable: {e}", exe.display())))?;
    }

    info!("update: installed new binary at {}", exe.display());
    Ok(())
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if from.exists() => {
            // Rename fails across filesystems; copy instead.
            debug!("update: rename failed ({err}), copying");
            fs::copy(from, to)?;
            let _ = fs::remove_file(from);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Remove a leftover `<exe>.old` from a previous update.
///
/// The old binary may still be locked right after a restart, so removal is
/// retried a few times, one second apart.
pub async fn cleanup_old_binary(exe: PathBuf) {
    let old = old_binary_path(&exe);
    if !old.exists() {
        return;
    }
    info!("update: found stale binary {}, cleaning up", old.display());
    for attempt in 1..=CLEANUP_ATTEMPTS {
        tokio::time::sleep(Duration::from_secs(1)).await;
        match tokio::fs::remove_file(&old).await {
            Ok(()) => {
                info!("update: removed stale binary (attempt {attempt})");
                return;
            }
            Err(err) => warn!(
                "update: removing stale binary failed (attempt {attempt}/{CLEANUP_ATTEMPTS}): {err}"
            ),
        }
    }
    warn!("update: giving up on {}, it may still be in use", old.display());
}
