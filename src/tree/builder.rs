use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use log::{debug, info, warn};

use crate::error::{Error, PartialTree, SubtreeFailure, TransportError};
use crate::models::DirectoryEntry;
use crate::networking::RepositoryHost;
use crate::resolver::{UrlResolver, join_path, leaf_name, validate_path, validate_tree_path};
use crate::session::Session;

use super::{DirectoryNode, FileLeaf};

/// Crawls a repository host into a [`DirectoryNode`] tree.
pub struct TreeBuilder<'a, H> {
    host: &'a H,
    resolver: &'a UrlResolver,
    session: &'a Session,
}

impl<'a, H: RepositoryHost> TreeBuilder<'a, H> {
    pub fn new(host: &'a H, resolver: &'a UrlResolver, session: &'a Session) -> Self {
        Self {
            host,
            resolver,
            session,
        }
    }

    /// Build the tree rooted at `root_path` (`""` for the repository root).
    ///
    /// Subtrees that cannot be listed are left out and reported through
    /// [`Error::PartialTree`], which still carries everything that was
    /// fetched. Only a failed root listing, cancellation before the root is
    /// listed, or a run of consecutive failures beyond the configured budget
    /// aborts the whole build.
    pub async fn build(&self, root_path: &str) -> Result<DirectoryNode, Error> {
        validate_tree_path(root_path)?;
        let repo = self.resolver.repo();
        info!("tree: building {} from {:?}", repo, root_path);

        let run = Traversal {
            builder: self,
            failures: Mutex::new(Vec::new()),
            consecutive_failures: AtomicUsize::new(0),
            tripped: AtomicBool::new(false),
            trip_cause: Mutex::new(None),
        };

        let entries = match run.list(root_path).await {
            Ok(entries) => entries,
            Err(Error::Transport(source)) => {
                return Err(Error::HostUnavailable {
                    what: format!("listing of {repo} at {root_path:?}"),
                    source,
                });
            }
            Err(other) => return Err(other),
        };

        let name = leaf_name(root_path, &repo.name).to_owned();
        let tree = run.assemble(name, root_path.to_owned(), entries, 0).await;

        if run.tripped.load(Ordering::SeqCst) {
            let source = lock(&run.trip_cause).take().unwrap_or(TransportError::Timeout);
            return Err(Error::HostUnavailable {
                what: format!(
                    "{repo} ({} consecutive subtree failures)",
                    self.session.limits().failure_budget
                ),
                source,
            });
        }

        let mut failures = run.failures.into_inner().unwrap_or_else(|p| p.into_inner());
        if failures.is_empty() {
            info!(
                "tree: complete, {} files under {:?}",
                tree.file_count(),
                root_path
            );
            return Ok(tree);
        }
        failures.sort_by(|a, b| a.path.cmp(&b.path));
        warn!(
            "tree: partial result, {} subtree(s) missing under {:?}",
            failures.len(),
            root_path
        );
        Err(Error::PartialTree(Box::new(PartialTree { tree, failures })))
    }
}

/// State for a single `build` call.
struct Traversal<'b, 'a, H> {
    builder: &'b TreeBuilder<'a, H>,
    failures: Mutex<Vec<SubtreeFailure>>,
    consecutive_failures: AtomicUsize,
    tripped: AtomicBool,
    trip_cause: Mutex<Option<TransportError>>,
}

impl<H: RepositoryHost> Traversal<'_, '_, H> {
    fn record(&self, path: String, error: Error) {
        debug!("tree: omitting {:?}: {}", path, error);
        lock(&self.failures).push(SubtreeFailure { path, error });
    }

    async fn list(&self, path: &str) -> Result<Vec<DirectoryEntry>, Error> {
        let session = self.builder.session;
        let limits = session.limits();
        let repo = self.builder.resolver.repo();
        let mut attempt = 0;
        loop {
            let result = {
                let _permit = session.acquire_listing().await?;
                session
                    .guard(
                        limits.listing_timeout(),
                        self.builder.host.list_directory(repo, path),
                    )
                    .await
            };

            let err = match result {
                Ok(entries) => return Ok(entries),
                Err(Error::Transport(err)) => err,
                Err(other) => return Err(other),
            };
            if let TransportError::RateLimited { retry_after } = &err {
                if self.quota_spent(&err) {
                    warn!(
                        "tree: host quota exhausted for {:?}, not waiting {}s for the reset",
                        path,
                        retry_after.unwrap_or_default().as_secs()
                    );
                    return Err(err.into());
                }
                let wait = retry_after.unwrap_or_else(|| limits.retry_backoff(attempt + 1));
                session.rate_limiter().pause(wait);
            }
            if session.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !err.is_retryable() || attempt >= limits.listing_retries {
                return Err(err.into());
            }
            attempt += 1;
            warn!(
                "tree: listing {:?} failed ({}), retry {}/{}",
                path, err, attempt, limits.listing_retries
            );
            tokio::time::sleep(limits.retry_backoff(attempt)).await;
        }
    }

    /// A quota reset further away than the configured wait is not worth
    /// sleeping through.
    fn quota_spent(&self, err: &TransportError) -> bool {
        matches!(
            err,
            TransportError::RateLimited { retry_after: Some(wait) }
                if *wait > self.builder.session.limits().max_quota_wait()
        )
    }

    async fn assemble(
        &self,
        name: String,
        path: String,
        entries: Vec<DirectoryEntry>,
        depth: usize,
    ) -> DirectoryNode {
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        let mut subdirs = Vec::new();

        for entry in entries {
            let child_path = join_path(&path, &entry.name);
            if entry.name.contains('/') || validate_path(&entry.name).is_err() {
                self.record(
                    child_path,
                    Error::invalid_path(&entry.name, "host returned an unusable entry name"),
                );
                continue;
            }
            if !seen.insert(entry.name.clone()) {
                warn!("tree: duplicate entry {:?} ignored", child_path);
                continue;
            }
            if entry.is_directory {
                subdirs.push((entry.name, child_path));
                continue;
            }
            match self.builder.resolver.resolve(&child_path) {
                Ok(urls) => files.push(FileLeaf {
                    name: entry.name,
                    path: child_path,
                    size: entry.size,
                    origin_url: urls.origin,
                    mirror_url: urls.mirror,
                }),
                Err(err) => self.record(child_path, err),
            }
        }

        let children = join_all(
            subdirs
                .into_iter()
                .map(|(name, path)| self.subtree(name, path, depth + 1)),
        )
        .await;

        DirectoryNode {
            name,
            path,
            files,
            dirs: children.into_iter().flatten().collect(),
        }
    }

    fn subtree(&self, name: String, path: String, depth: usize) -> BoxFuture<'_, Option<DirectoryNode>> {
        async move {
            let limit = self.builder.session.limits().max_depth;
            if depth > limit {
                self.record(path.clone(), Error::DepthExceeded { path, limit });
                return None;
            }
            if self.tripped.load(Ordering::SeqCst) {
                return None;
            }
            if self.builder.session.is_cancelled() {
                self.record(path, Error::Cancelled);
                return None;
            }

            match self.list(&path).await {
                Ok(entries) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    Some(self.assemble(name, path, entries, depth).await)
                }
                Err(Error::Transport(err)) => {
                    let run = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    let exhausted =
                        run >= self.builder.session.limits().failure_budget || self.quota_spent(&err);
                    if exhausted && !self.tripped.swap(true, Ordering::SeqCst)
                    {
                        warn!("tree: giving up after {run} consecutive listing failure(s): {err}");
                        *lock(&self.trip_cause) = Some(err.clone());
                    }
                    self.record(path, Error::Transport(err));
                    None
                }
                Err(other) => {
                    self.record(path, other);
                    None
                }
            }
        }
        .boxed()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
