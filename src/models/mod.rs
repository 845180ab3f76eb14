use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A repository on the host, pinned to one branch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".into()
}

impl Default for RepoRef {
    fn default() -> Self {
        Self {
            owner: "gubaiovo".into(),
            name: "JNU-EXAM".into(),
            branch: default_branch(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.name, self.branch)
    }
}

/// One entry of a host directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
}

impl DirectoryEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            is_directory: false,
            size,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_directory: true,
            size: 0,
        }
    }
}

/// Wire shape of one tree entry as consumed by renderers.
///
/// Directories carry `files`/`dirs` and no URLs; file leaves carry both
/// URLs and no children.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirs: Option<Vec<FileNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cf_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_raw_url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeInfo {
    #[serde(default)]
    pub show: bool,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub has_update: bool,
    pub current_ver: String,
    pub remote_ver: String,
    pub update_desc: String,
    pub is_force: bool,
    pub download_url: String,
    pub checksum: String,
    pub notice: NoticeInfo,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub name: String,
    pub url: String,
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformArtifact {
    pub url: String,
    #[serde(default)]
    pub checksum: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    pub version: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub platforms: HashMap<String, PlatformArtifact>,
}

/// The remote-published document describing the latest release and notice.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    #[serde(default)]
    pub notice: NoticeInfo,
    pub update: UpdateManifest,
}

/// Which of a file's two published URLs a source downloads from first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FileKey {
    /// `cf_url`, the accelerated mirror.
    #[default]
    Mirror,
    /// `github_raw_url`, the origin host.
    Origin,
}

impl FileKey {
    pub fn parse(key: &str) -> Option<Self> {
        match key.trim() {
            "cf_url" => Some(FileKey::Mirror),
            "github_raw_url" => Some(FileKey::Origin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileKey::Mirror => "cf_url",
            FileKey::Origin => "github_raw_url",
        }
    }
}

/// A named download source: where its tree snapshot lives and which file
/// URL it serves.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub json_url: String,
    #[serde(default)]
    pub file_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_url: Option<String>,
}

impl SourceConfig {
    pub fn new(json_url: impl Into<String>, key: FileKey) -> Self {
        Self {
            json_url: json_url.into(),
            file_key: key.as_str().into(),
            dir_url: None,
        }
    }

    /// The snapshot URL; older lists only publish `dir_url`.
    pub fn snapshot_url(&self) -> Option<&str> {
        let json_url = self.json_url.trim();
        if !json_url.is_empty() {
            return Some(json_url);
        }
        self.dir_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn key(&self) -> Option<FileKey> {
        FileKey::parse(&self.file_key)
    }
}
