//! Error types shared by every part of the mirror client.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::tree::DirectoryNode;

/// Failure reported by a host capability (listing, fetch, manifest).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    /// The host's request quota is spent; `retry_after` is when it resets,
    /// if the host said.
    #[error("rate limit exhausted{}", reset_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("not found")]
    NotFound,

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether the same request may succeed if issued again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout
            | TransportError::RateLimited { .. }
            | TransportError::Request(_) => true,
            TransportError::Status(code) => *code >= 500,
            TransportError::NotFound | TransportError::Decode(_) => false,
        }
    }
}

fn reset_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(wait) => format!(", quota resets in {}s", wait.as_secs()),
        None => String::new(),
    }
}

/// One subtree that could not be included in a built tree.
#[derive(Debug)]
pub struct SubtreeFailure {
    pub path: String,
    pub error: Error,
}

impl fmt::Display for SubtreeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{path}: {}", self.error)
    }
}

/// A usable tree with one or more subtrees missing.
#[derive(Debug)]
pub struct PartialTree {
    pub tree: DirectoryNode,
    pub failures: Vec<SubtreeFailure>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid repository path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("directory {path} is deeper than the limit of {limit}")]
    DepthExceeded { path: String, limit: usize },

    #[error("tree is incomplete: {} subtree(s) could not be fetched", .0.failures.len())]
    PartialTree(Box<PartialTree>),

    #[error("malformed tree at {path:?}: {reason}")]
    InvalidTree { path: String, reason: String },

    #[error("{what} unavailable: {source}")]
    HostUnavailable {
        what: String,
        #[source]
        source: TransportError,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("download of {name} failed: {reason}")]
    DownloadFailed { name: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid version {0:?}")]
    Version(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("install failed: {0}")]
    Install(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid_path(path: &str, reason: &'static str) -> Self {
        Error::InvalidPath {
            path: path.to_owned(),
            reason,
        }
    }
}
