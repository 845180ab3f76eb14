use std::cmp::Ordering;

use log::{debug, info, warn};
use semver::{BuildMetadata, Version};

use crate::error::{Error, TransportError};
use crate::models::{CheckResult, NoticeInfo};
use crate::networking::ManifestSource;
use crate::session::Session;

mod install;

pub use install::{cleanup_old_binary, install_update};

/// Version of this build, used when the caller does not supply one.
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Compares the running version with the published manifest.
pub struct UpdateChecker<'a, M> {
    source: &'a M,
    session: &'a Session,
    platform: String,
}

impl<'a, M: ManifestSource> UpdateChecker<'a, M> {
    pub fn new(source: &'a M, session: &'a Session) -> Self {
        Self {
            source,
            session,
            platform: platform_key(),
        }
    }

    /// Override the `<os>-<arch>` key used to pick an artifact.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Check whether the manifest advertises a newer version.
    ///
    /// # Errors
    /// A manifest that cannot be fetched or parsed is reported as an error,
    /// never as "no update available".
    pub async fn check(&self, current_version: &str) -> Result<CheckResult, Error> {
        let current = parse_version(current_version)?;
        info!("update: checking for versions newer than {}", current);

        let meta = {
            let _permit = self.session.acquire_transfer().await?;
            let timeout = self.session.limits().manifest_timeout();
            match self.session.guard(timeout, self.source.fetch_manifest()).await {
                Ok(meta) => meta,
                Err(Error::Transport(source)) => return Err(manifest_unavailable(source)),
                Err(other) => return Err(other),
            }
        };

        let remote = parse_version(&meta.update.version)?;
        let has_update = compare_versions(&remote, &current) == Ordering::Greater;
        let artifact = meta.update.platforms.get(&self.platform).cloned();
        debug!(
            "update: remote {} vs local {}, platform {} artifact present: {}",
            remote,
            current,
            self.platform,
            artifact.is_some()
        );
        if has_update && artifact.is_none() {
            warn!(
                "update: version {} has no artifact for platform {}",
                remote, self.platform
            );
        }
        let artifact = artifact.unwrap_or_default();

        Ok(CheckResult {
            has_update,
            current_ver: current_version.trim().to_owned(),
            remote_ver: meta.update.version,
            update_desc: meta.update.desc,
            is_force: meta.update.force,
            download_url: artifact.url,
            checksum: artifact.checksum.trim().to_lowercase(),
            notice: meta.notice,
        })
    }
}

fn manifest_unavailable(source: TransportError) -> Error {
    Error::HostUnavailable {
        what: "update manifest".into(),
        source,
    }
}

/// The notice to display, unless it is hidden or was already shown.
pub fn pending_notice<'r>(result: &'r CheckResult, last_seen_id: Option<&str>) -> Option<&'r NoticeInfo> {
    let notice = &result.notice;
    if !notice.show {
        return None;
    }
    match last_seen_id {
        Some(seen) if !notice.id.is_empty() && seen == notice.id => None,
        _ => Some(notice),
    }
}

/// Normalize version string by removing 'v' prefix and cleaning up.
fn normalize_version(version: &str) -> String {
    version.trim().trim_start_matches(['v', 'V']).to_owned()
}

/// Parse a version, padding missing minor/patch components with zeros.
///
/// Build metadata is dropped so it never affects ordering.
pub fn parse_version(raw: &str) -> Result<Version, Error> {
    let normalized = normalize_version(raw);
    let split = normalized.find(['-', '+']).unwrap_or(normalized.len());
    let (core, suffix) = normalized.split_at(split);
    let padded = match core.matches('.').count() {
        0 => format!("{core}.0.0{suffix}"),
        1 => format!("{core}.0{suffix}"),
        _ => normalized.clone(),
    };
    let mut version = Version::parse(&padded).map_err(|_| Error::Version(raw.trim().to_owned()))?;
    version.build = BuildMetadata::EMPTY;
    Ok(version)
}

/// Semantic-version precedence; pre-releases order below their release.
pub fn compare_versions(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

/// Platform key in `<os>-<arch>` form, e.g. `linux-amd64`.
pub fn platform_key() -> String {
    let os = if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else {
        "linux"
    };

    let arch = if cfg!(target_arch = "x86_64") {
        "amd64"
    } else if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        std::env::consts::ARCH
    };

    format!("{os}-{arch}")
}
