//! Named download sources: which snapshot to read and which of a file's
//! URLs to try first.

use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::error::Error;
use crate::models::{FileKey, SourceConfig};
use crate::networking::SnapshotSource;
use crate::session::Session;

use super::AppConfig;

pub const DEFAULT_SOURCE: &str = "cloudflare";

const ORIGIN_SNAPSHOT_URL: &str =
    "https://raw.githubusercontent.com/gubaiovo/JNU-EXAM/main/directory_structure.json";
const MIRROR_SNAPSHOT_URL: &str = "https://jnuexam.xyz/directory_structure.json";

pub fn default_sources() -> BTreeMap<String, SourceConfig> {
    BTreeMap::from([
        (
            "github".to_owned(),
            SourceConfig::new(ORIGIN_SNAPSHOT_URL, FileKey::Origin),
        ),
        (
            DEFAULT_SOURCE.to_owned(),
            SourceConfig::new(MIRROR_SNAPSHOT_URL, FileKey::Mirror),
        ),
    ])
}

/// A source resolved to something the tree and download commands can use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub snapshot_url: String,
    pub key: FileKey,
}

impl AppConfig {
    /// Look up `name` (or the configured default) ignoring case.
    pub fn source(&self, name: Option<&str>) -> Result<Source, Error> {
        let wanted = name.unwrap_or(&self.default_source).trim();
        let Some((name, config)) = self
            .sources
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(wanted))
        else {
            let known: Vec<&str> = self.sources.keys().map(String::as_str).collect();
            return Err(Error::Config(format!(
                "unknown source {wanted:?}, expected one of: {}",
                known.join(", ")
            )));
        };
        let snapshot_url = config
            .snapshot_url()
            .ok_or_else(|| Error::Config(format!("source {name:?} has no snapshot URL")))?;
        let key = config.key().ok_or_else(|| {
            Error::Config(format!(
                "source {name:?} serves {:?}, which this client cannot download",
                config.file_key
            ))
        })?;
        debug!("sources: {name} -> {snapshot_url} ({})", key.as_str());
        Ok(Source {
            name: name.clone(),
            snapshot_url: snapshot_url.to_owned(),
            key,
        })
    }

    /// Merge the published source list over the configured one. A list
    /// that cannot be fetched leaves the configured sources in place.
    pub async fn refresh_sources<S: SnapshotSource>(&mut self, host: &S, session: &Session) {
        let Some(url) = self.source_list_url.clone() else {
            return;
        };
        let fetched = {
            let Ok(_permit) = session.acquire_transfer().await else {
                return;
            };
            let timeout = session.limits().manifest_timeout();
            session.guard(timeout, host.fetch_source_list(&url)).await
        };
        match fetched {
            Ok(remote) => {
                info!("sources: {} published source(s) from {url}", remote.len());
                self.sources.extend(remote);
            }
            Err(err) => warn!("sources: cannot fetch {url}, using configured sources: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Limits;
    use crate::error::TransportError;
    use crate::models::FileNode;

    enum SourceList {
        Ready(BTreeMap<String, SourceConfig>),
        Broken,
        Silent,
    }

    impl SnapshotSource for SourceList {
        async fn fetch_snapshot(&self, _url: &str) -> Result<FileNode, TransportError> {
            Err(TransportError::NotFound)
        }

        async fn fetch_source_list(
            &self,
            _url: &str,
        ) -> Result<BTreeMap<String, SourceConfig>, TransportError> {
            match self {
                SourceList::Ready(list) => Ok(list.clone()),
                SourceList::Broken => Err(TransportError::Status(500)),
                SourceList::Silent => std::future::pending().await,
            }
        }
    }

    fn with_list_url() -> AppConfig {
        AppConfig {
            source_list_url: Some("https://lists.test/sources.json".into()),
            ..AppConfig::default()
        }
    }

    #[test]
    fn default_source_reads_the_mirror_snapshot() {
        let source = AppConfig::default().source(None).unwrap();
        assert_eq!(source.name, DEFAULT_SOURCE);
        assert_eq!(source.snapshot_url, MIRROR_SNAPSHOT_URL);
        assert_eq!(source.key, FileKey::Mirror);
    }

    #[test]
    fn picks_sources_ignoring_case() {
        let source = AppConfig::default().source(Some("GitHub")).unwrap();
        assert_eq!(source.name, "github");
        assert_eq!(source.key, FileKey::Origin);
        assert_eq!(source.snapshot_url, ORIGIN_SNAPSHOT_URL);
    }

    #[test]
    fn rejects_unknown_and_unusable_sources() {
        let mut config = AppConfig::default();
        let err = config.source(Some("ftp")).unwrap_err();
        assert!(err.to_string().contains("cloudflare, github"));

        config.sources.insert(
            "gitee".into(),
            SourceConfig {
                json_url: "https://gitee.test/tree.json".into(),
                file_key: "gitee_raw_url".into(),
                dir_url: None,
            },
        );
        assert!(matches!(config.source(Some("gitee")), Err(Error::Config(_))));

        config.sources.insert("empty".into(), SourceConfig::default());
        assert!(matches!(config.source(Some("empty")), Err(Error::Config(_))));
    }

    #[test]
    fn older_lists_fall_back_to_dir_url() {
        let mut config = AppConfig::default();
        config.sources.insert(
            "legacy".into(),
            SourceConfig {
                json_url: String::new(),
                file_key: "cf_url".into(),
                dir_url: Some("https://legacy.test/dir.json".into()),
            },
        );
        assert_eq!(
            config.source(Some("legacy")).unwrap().snapshot_url,
            "https://legacy.test/dir.json"
        );
    }

    #[tokio::test]
    async fn published_sources_override_configured_ones() {
        let mut config = with_list_url();
        let remote = BTreeMap::from([
            (
                "github".to_owned(),
                SourceConfig::new("https://new.test/tree.json", FileKey::Origin),
            ),
            (
                "r2".to_owned(),
                SourceConfig::new("https://r2.test/tree.json", FileKey::Mirror),
            ),
        ]);
        let session = Session::new(Limits::default());

        config.refresh_sources(&SourceList::Ready(remote), &session).await;

        assert_eq!(config.sources.len(), 3);
        assert_eq!(
            config.source(Some("github")).unwrap().snapshot_url,
            "https://new.test/tree.json"
        );
        assert_eq!(config.source(Some("r2")).unwrap().key, FileKey::Mirror);
    }

    #[tokio::test]
    async fn unreachable_list_keeps_configured_sources() {
        let session = Session::new(Limits::default());
        let mut config = with_list_url();
        config.refresh_sources(&SourceList::Broken, &session).await;
        assert_eq!(config.sources, default_sources());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_list_host_times_out() {
        let session = Session::new(Limits::default());
        let mut config = with_list_url();
        let started = tokio::time::Instant::now();
        config.refresh_sources(&SourceList::Silent, &session).await;
        assert_eq!(config.sources, default_sources());
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn no_list_url_skips_the_fetch() {
        let session = Session::new(Limits::default());
        let mut config = AppConfig::default();
        config.refresh_sources(&SourceList::Broken, &session).await;
        assert_eq!(config.sources, default_sources());
    }
}
