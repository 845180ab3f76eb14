use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, warn};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;

use crate::config::AppConfig;
use crate::error::{Error, TransportError};
use crate::models::{AppMetadata, DirectoryEntry, FileNode, RepoRef, SourceConfig};

const USER_AGENT: &str = concat!("mirror-fetch/", env!("CARGO_PKG_VERSION"));

/// Lists directories of a remote repository.
pub trait RepositoryHost: Send + Sync {
    fn list_directory(
        &self,
        repo: &RepoRef,
        path: &str,
    ) -> impl Future<Output = Result<Vec<DirectoryEntry>, TransportError>> + Send;
}

/// An open response body.
pub struct FetchResponse {
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

/// Fetches raw file content by URL.
pub trait ContentFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<FetchResponse, TransportError>> + Send;
}

/// Fetches published tree snapshots and the list of download sources.
pub trait SnapshotSource: Send + Sync {
    fn fetch_snapshot(&self, url: &str) -> impl Future<Output = Result<FileNode, TransportError>> + Send;

    fn fetch_source_list(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<BTreeMap<String, SourceConfig>, TransportError>> + Send;
}

/// Retrieves the published update manifest.
pub trait ManifestSource: Send + Sync {
    fn fetch_manifest(&self) -> impl Future<Output = Result<AppMetadata, TransportError>> + Send;
}

#[derive(Debug, Deserialize)]
struct ContentsEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: u64,
}

#[derive(Clone)]
pub struct NetworkClient {
    client: Client,
    api_base: Url,
    manifest_url: String,
    token: Option<String>,
}

impl NetworkClient {
    pub fn new(config: &AppConfig) -> Result<Self, Error> {
        let api_base = Url::parse(&config.api_base)
            .map_err(|e| Error::Config(format!("bad api_base {:?}: {e}", config.api_base)))?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(config.limits.transfer_timeout())
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Ok(Self {
            client,
            api_base,
            manifest_url: config.manifest_url.clone(),
            token: config.github_token.clone(),
        })
    }

    fn contents_url(&self, repo: &RepoRef, path: &str) -> Result<Url, TransportError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Request(format!("api base {} has no path", self.api_base)))?
            .pop_if_empty()
            .extend(["repos", repo.owner.as_str(), repo.name.as_str(), "contents"])
            .extend(path.split('/').filter(|s| !s.is_empty()));
        url.query_pairs_mut().append_pair("ref", &repo.branch);
        Ok(url)
    }
}

impl RepositoryHost for NetworkClient {
    async fn list_directory(
        &self,
        repo: &RepoRef,
        path: &str,
    ) -> Result<Vec<DirectoryEntry>, TransportError> {
        let url = self.contents_url(repo, path)?;
        debug!("listing: GET {url}");
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let resp = check_status(request.send().await.map_err(map_reqwest)?)?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        if !body.is_array() {
            return Err(TransportError::Decode(format!("{path:?} is not a directory")));
        }
        let raw: Vec<ContentsEntry> =
            serde_json::from_value(body).map_err(|e| TransportError::Decode(e.to_string()))?;

        let entries = raw
            .into_iter()
            .filter_map(|entry| match entry.kind.as_str() {
                "dir" => Some(DirectoryEntry::dir(entry.name)),
                "file" | "symlink" => Some(DirectoryEntry::file(entry.name, entry.size)),
                other => {
                    debug!("listing: skipping {} entry {}", other, entry.name);
                    None
                }
            })
            .collect();
        Ok(entries)
    }
}

impl ContentFetcher for NetworkClient {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, TransportError> {
        let resp = check_status(self.client.get(url).send().await.map_err(map_reqwest)?)?;
        let content_length = resp.content_length();
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_reqwest))
            .boxed();
        Ok(FetchResponse {
            content_length,
            body,
        })
    }
}

impl SnapshotSource for NetworkClient {
    async fn fetch_snapshot(&self, url: &str) -> Result<FileNode, TransportError> {
        debug!("snapshot: GET {url}");
        let resp = check_status(self.client.get(url).send().await.map_err(map_reqwest)?)?;
        resp.json::<FileNode>()
            .await
            .map_err(|e| TransportError::Decode(format!("snapshot: {e}")))
    }

    async fn fetch_source_list(&self, url: &str) -> Result<BTreeMap<String, SourceConfig>, TransportError> {
        debug!("sources: GET {url}");
        let resp = check_status(self.client.get(url).send().await.map_err(map_reqwest)?)?;
        resp.json::<BTreeMap<String, SourceConfig>>()
            .await
            .map_err(|e| TransportError::Decode(format!("source list: {e}")))
    }
}

impl ManifestSource for NetworkClient {
    async fn fetch_manifest(&self) -> Result<AppMetadata, TransportError> {
        debug!("update: GET {}", self.manifest_url);
        let resp = check_status(
            self.client
                .get(&self.manifest_url)
                .send()
                .await
                .map_err(map_reqwest)?,
        )?;
        resp.json::<AppMetadata>()
            .await
            .map_err(|e| TransportError::Decode(format!("manifest: {e}")))
    }
}

fn check_status(resp: Response) -> Result<Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    Err(classify_status(status, resp.headers()))
}

fn classify_status(status: StatusCode, headers: &HeaderMap) -> TransportError {
    let quota_exhausted = header_str(headers, "x-ratelimit-remaining").is_some_and(|v| v == "0");
    let rate_limited = || TransportError::RateLimited {
        retry_after: quota_reset(headers, chrono::Utc::now().timestamp()),
    };
    match status {
        StatusCode::NOT_FOUND => TransportError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => rate_limited(),
        StatusCode::FORBIDDEN if quota_exhausted => rate_limited(),
        other => TransportError::Status(other.as_u16()),
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// How long until the host accepts requests again, from `retry-after`
/// (seconds) or `x-ratelimit-reset` (unix time).
fn quota_reset(headers: &HeaderMap, now_unix: i64) -> Option<Duration> {
    if let Some(secs) = header_str(headers, "retry-after").and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }
    let reset = header_str(headers, "x-ratelimit-reset")?.parse::<i64>().ok()?;
    Some(Duration::from_secs(u64::try_from(reset - now_unix).unwrap_or(0)))
}

fn map_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_decode() {
        TransportError::Decode(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn client() -> NetworkClient {
        NetworkClient::new(&AppConfig::default()).unwrap()
    }

    #[test]
    fn builds_contents_url_with_encoded_path() {
        let url = client()
            .contents_url(&RepoRef::default(), "高数/2023 期末")
            .unwrap();
        assert!(
            url.as_str()
                .starts_with("https://api.github.com/repos/gubaiovo/JNU-EXAM/contents/")
        );
        assert!(url.as_str().ends_with("?ref=main"));
        assert!(!url.as_str().contains(' '));
    }

    #[test]
    fn root_listing_targets_contents_endpoint() {
        let url = client().contents_url(&RepoRef::default(), "").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.github.com/repos/gubaiovo/JNU-EXAM/contents?ref=main"
        );
    }

    #[test]
    fn classifies_rate_limit_responses() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, &headers),
            TransportError::Status(403)
        );
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, &headers),
            TransportError::RateLimited { retry_after: None }
        );
        headers.insert("retry-after", HeaderValue::from_static("30"));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers),
            TransportError::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, &HeaderMap::new()),
            TransportError::NotFound
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, &HeaderMap::new()),
            TransportError::Status(502)
        );
    }

    #[test]
    fn reads_quota_reset_time() {
        let mut headers = HeaderMap::new();
        assert_eq!(quota_reset(&headers, 1_000), None);
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1600"));
        assert_eq!(quota_reset(&headers, 1_000), Some(Duration::from_secs(600)));
        assert_eq!(quota_reset(&headers, 2_000), Some(Duration::ZERO));
        headers.insert("retry-after", HeaderValue::from_static("5"));
        assert_eq!(quota_reset(&headers, 1_000), Some(Duration::from_secs(5)));
    }

    #[test]
    fn parses_contents_entries() {
        let raw = r#"[{"name": "a.pdf", "type": "file", "size": 12, "path": "x/a.pdf"},
                      {"name": "sub", "type": "dir", "path": "x/sub"}]"#;
        let entries: Vec<ContentsEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(entries[0].size, 12);
        assert_eq!(entries[1].kind, "dir");
        assert_eq!(entries[1].size, 0);
    }
}
