use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::{RepoRef, SourceConfig};

mod sources;

pub use sources::{DEFAULT_SOURCE, Source, default_sources};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const DEFAULT_ORIGIN_BASE: &str = "https://raw.githubusercontent.com";
const DEFAULT_MIRROR_BASE: &str = "https://jnuexam.xyz";
const DEFAULT_MANIFEST_URL: &str = "https://jnuexam.gubaiovo.com/metadata.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub repository: RepoRef,
    pub api_base: String,
    pub origin_base: String,
    pub mirror_base: String,
    pub manifest_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
    /// Download sources by name, see [`AppConfig::source`].
    pub sources: BTreeMap<String, SourceConfig>,
    pub default_source: String,
    /// Published source list merged over `sources` before use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_list_url: Option<String>,
    pub limits: Limits,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            repository: RepoRef::default(),
            api_base: DEFAULT_API_BASE.into(),
            origin_base: DEFAULT_ORIGIN_BASE.into(),
            mirror_base: DEFAULT_MIRROR_BASE.into(),
            manifest_url: DEFAULT_MANIFEST_URL.into(),
            github_token: None,
            sources: default_sources(),
            default_source: DEFAULT_SOURCE.into(),
            source_list_url: None,
            limits: Limits::default(),
        }
    }
}

/// Traversal, retry and timeout bounds for one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_depth: usize,
    pub workers: usize,
    pub listing_retries: u32,
    pub failure_budget: usize,
    /// Listing quota when a token is configured.
    pub requests_per_minute: u32,
    /// Listing quota without a token; the host allows far fewer anonymous
    /// requests.
    pub anonymous_requests_per_hour: u32,
    /// Longest quota reset the crawler will wait out before giving up.
    pub max_quota_wait_secs: u64,
    pub retry_backoff_ms: u64,
    pub listing_timeout_secs: u64,
    pub manifest_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_depth: 16,
            workers: 4,
            listing_retries: 2,
            failure_budget: 8,
            requests_per_minute: 60,
            anonymous_requests_per_hour: 60,
            max_quota_wait_secs: 60,
            retry_backoff_ms: 250,
            listing_timeout_secs: 15,
            manifest_timeout_secs: 5,
            transfer_timeout_secs: 60,
        }
    }
}

impl Limits {
    pub fn listing_timeout(&self) -> Duration {
        Duration::from_secs(self.listing_timeout_secs.max(1))
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_secs(self.manifest_timeout_secs.max(1))
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs.max(1))
    }

    pub fn max_quota_wait(&self) -> Duration {
        Duration::from_secs(self.max_quota_wait_secs)
    }

    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

impl AppConfig {
    /// Read the config at `path`, falling back to defaults when it is absent.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut config = match std::fs::read(path) {
            Ok(bytes) => {
                debug!("config: reading {}", path.display());
                serde_json::from_slice::<AppConfig>(&bytes)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("config: {} not found, using defaults", path.display());
                AppConfig::default()
            }
            Err(err) => return Err(err.into()),
        };
        if config.github_token.is_none() {
            config.github_token = std::env::var("GITHUB_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)?;
        info!("config: wrote {}", path.display());
        Ok(())
    }

    fn validate(&self) -> Result<(), Error> {
        if self.repository.owner.trim().is_empty() || self.repository.name.trim().is_empty() {
            return Err(Error::Config("repository owner and name are required".into()));
        }
        if self.limits.workers == 0 {
            return Err(Error::Config("limits.workers must be at least 1".into()));
        }
        if self.limits.failure_budget == 0 {
            return Err(Error::Config("limits.failure_budget must be at least 1".into()));
        }
        let known = self
            .sources
            .keys()
            .any(|name| name.eq_ignore_ascii_case(self.default_source.trim()));
        if !known && self.source_list_url.is_none() {
            return Err(Error::Config(format!(
                "default_source {:?} is not among the configured sources",
                self.default_source
            )));
        }
        Ok(())
    }
}
