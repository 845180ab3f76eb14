use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::future::join_all;
use futures_util::stream::BoxStream;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::error::{Error, TransportError};
use crate::models::{CheckResult, DownloadItem, FileKey};
use crate::networking::ContentFetcher;
use crate::session::Session;
use crate::tree::FileLeaf;
use crate::util::{format_speed, sanitize_filename};

/// One unit of work: where to fetch from, where to put it, and how to check it.
#[derive(Clone, Debug)]
pub struct DownloadJob {
    pub item: DownloadItem,
    /// Tried once if `item.url` fails for any reason other than integrity.
    pub fallback_url: Option<String>,
    pub expected_size: Option<u64>,
    /// Lowercase hex SHA-256; set only for update artifacts.
    pub checksum: Option<String>,
    pub dest: PathBuf,
}

impl DownloadJob {
    /// A browsed repository file, fetched first from the URL `key` names
    /// with the other one as fallback.
    ///
    /// The file lands under `dest_dir` at its path relative to `base`.
    pub fn for_file(leaf: &FileLeaf, dest_dir: &Path, base: &str, key: FileKey) -> Self {
        let relative = if base.is_empty() {
            leaf.path.as_str()
        } else {
            leaf.path
                .strip_prefix(base)
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(&leaf.name)
        };
        let dest = relative
            .split('/')
            .map(sanitize_filename)
            .fold(dest_dir.to_path_buf(), |acc, segment| acc.join(segment));

        let (primary, secondary) = match key {
            FileKey::Mirror => (&leaf.mirror_url, &leaf.origin_url),
            FileKey::Origin => (&leaf.origin_url, &leaf.mirror_url),
        };

        Self {
            item: DownloadItem {
                name: leaf.name.clone(),
                url: primary.clone(),
                size: leaf.size,
            },
            fallback_url: (primary != secondary).then(|| secondary.clone()),
            expected_size: Some(leaf.size),
            checksum: None,
            dest,
        }
    }

    /// The update artifact advertised by a check result.
    pub fn for_update(check: &CheckResult, dest: PathBuf) -> Result<Self, Error> {
        let name = format!("update-{}", check.remote_ver);
        if check.download_url.trim().is_empty() {
            return Err(Error::DownloadFailed {
                name,
                reason: "no artifact is published for this platform".into(),
            });
        }
        if check.checksum.trim().is_empty() {
            return Err(Error::DownloadFailed {
                name,
                reason: "manifest carries no checksum for the artifact".into(),
            });
        }
        Ok(Self {
            item: DownloadItem {
                name,
                url: check.download_url.clone(),
                size: 0,
            },
            fallback_url: None,
            expected_size: None,
            checksum: Some(check.checksum.trim().to_lowercase()),
            dest,
        })
    }
}

/// Bytes completed across a whole batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregateProgress {
    pub completed_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Clone, Debug)]
pub enum DownloadEvent {
    Started {
        index: usize,
        name: String,
    },
    Progress {
        index: usize,
        downloaded: u64,
        total: Option<u64>,
        speed: String,
        aggregate: AggregateProgress,
    },
    FallingBack {
        index: usize,
        url: String,
        reason: String,
    },
    Finished {
        index: usize,
        ok: bool,
        aggregate: AggregateProgress,
    },
}

#[derive(Clone, Debug)]
pub struct CompletedDownload {
    pub path: PathBuf,
    pub bytes: u64,
    pub source_url: String,
    pub used_fallback: bool,
    pub sha256: Option<String>,
    pub finished_at: String,
}

#[derive(Debug)]
pub struct ItemOutcome {
    pub item: DownloadItem,
    pub result: Result<CompletedDownload, Error>,
}

/// Per-item results in the order the jobs were submitted.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<ItemOutcome>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = (&DownloadItem, &CompletedDownload)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|done| (&o.item, done)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&DownloadItem, &Error)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|err| (&o.item, err)))
    }

    pub fn fallback_count(&self) -> usize {
        self.succeeded().filter(|(_, done)| done.used_fallback).count()
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed().next().is_none()
    }
}

struct Aggregate {
    completed: AtomicU64,
    total: AtomicU64,
}

impl Aggregate {
    fn snapshot(&self) -> AggregateProgress {
        AggregateProgress {
            completed_bytes: self.completed.load(Ordering::SeqCst),
            total_bytes: self.total.load(Ordering::SeqCst),
        }
    }

    fn add(&self, bytes: u64) {
        self.completed.fetch_add(bytes, Ordering::SeqCst);
    }

    fn rollback(&self, bytes: u64, total: u64) {
        self.completed.fetch_sub(bytes, Ordering::SeqCst);
        self.total.fetch_sub(total, Ordering::SeqCst);
    }
}

/// Fetches batches of files through the session's worker pool.
pub struct DownloadManager<'a, F> {
    fetcher: &'a F,
    session: &'a Session,
    events: Option<mpsc::UnboundedSender<DownloadEvent>>,
}

impl<'a, F: ContentFetcher> DownloadManager<'a, F> {
    pub fn new(fetcher: &'a F, session: &'a Session) -> Self {
        Self {
            fetcher,
            session,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<DownloadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: DownloadEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Download every job; one failure never stops its siblings.
    ///
    /// Jobs whose destinations collide are renamed `name (1).ext` and so on,
    /// in submission order.
    pub async fn download_all(&self, mut jobs: Vec<DownloadJob>) -> BatchReport {
        unique_destinations(&mut jobs);
        let aggregate = Aggregate {
            completed: AtomicU64::new(0),
            total: AtomicU64::new(jobs.iter().filter_map(|j| j.expected_size).sum()),
        };
        info!(
            "download: starting {} item(s), {} bytes known",
            jobs.len(),
            aggregate.snapshot().total_bytes
        );

        let outcomes = join_all(
            jobs.into_iter()
                .enumerate()
                .map(|(index, job)| self.download_one(index, job, &aggregate)),
        )
        .await;

        let report = BatchReport {
            outcomes,
            cancelled: self.session.is_cancelled(),
        };
        info!(
            "download: {} succeeded ({} via fallback), {} failed",
            report.succeeded().count(),
            report.fallback_count(),
            report.failed().count()
        );
        report
    }

    /// Download a single update artifact and verify it.
    pub async fn download_update(&self, job: DownloadJob) -> Result<CompletedDownload, Error> {
        let mut report = self.download_all(vec![job]).await;
        match report.outcomes.pop() {
            Some(outcome) => outcome.result,
            None => Err(Error::Cancelled),
        }
    }

    async fn download_one(&self, index: usize, job: DownloadJob, aggregate: &Aggregate) -> ItemOutcome {
        if self.session.is_cancelled() {
            return ItemOutcome {
                item: job.item,
                result: Err(Error::Cancelled),
            };
        }
        self.emit(DownloadEvent::Started {
            index,
            name: job.item.name.clone(),
        });

        let result = match self.attempt(index, &job, &job.item.url, aggregate).await {
            Ok(done) => Ok(done),
            Err(err @ (Error::ChecksumMismatch { .. } | Error::Cancelled)) => Err(err),
            Err(err) => self.fall_back(index, &job, err, aggregate).await,
        };

        match &result {
            Ok(done) => debug!(
                "download: {} -> {} ({} bytes from {}, finished {})",
                job.item.name,
                done.path.display(),
                done.bytes,
                done.source_url,
                done.finished_at
            ),
            Err(err) => warn!("download: {} failed: {}", job.item.name, err),
        }
        self.emit(DownloadEvent::Finished {
            index,
            ok: result.is_ok(),
            aggregate: aggregate.snapshot(),
        });
        ItemOutcome {
            item: job.item,
            result,
        }
    }

    async fn fall_back(
        &self,
        index: usize,
        job: &DownloadJob,
        first: Error,
        aggregate: &Aggregate,
    ) -> Result<CompletedDownload, Error> {
        let failed = |reason: String| Error::DownloadFailed {
            name: job.item.name.clone(),
            reason,
        };
        let Some(fallback) = job
            .fallback_url
            .as_deref()
            .filter(|url| *url != job.item.url)
        else {
            return Err(failed(first.to_string()));
        };
        if self.session.is_cancelled() {
            return Err(Error::Cancelled);
        }

        warn!(
            "download: {} via mirror failed ({}), retrying from origin",
            job.item.name, first
        );
        self.emit(DownloadEvent::FallingBack {
            index,
            url: fallback.to_owned(),
            reason: first.to_string(),
        });
        match self.attempt(index, job, fallback, aggregate).await {
            Ok(mut done) => {
                done.used_fallback = true;
                Ok(done)
            }
            Err(err @ (Error::ChecksumMismatch { .. } | Error::Cancelled)) => Err(err),
            Err(err) => Err(failed(format!("mirror: {first}; origin: {err}"))),
        }
    }

    async fn attempt(
        &self,
        index: usize,
        job: &DownloadJob,
        url: &str,
        aggregate: &Aggregate,
    ) -> Result<CompletedDownload, Error> {
        let _permit = self.session.acquire_transfer().await?;
        debug!("download: {} <- {}", job.item.name, url);

        let timeout = self.session.limits().transfer_timeout();
        let response = self.session.guard(timeout, self.fetcher.fetch(url)).await?;

        if let (Some(expected), Some(announced)) = (job.expected_size, response.content_length)
            && expected != announced
        {
            return Err(Error::SizeMismatch {
                expected,
                actual: announced,
            });
        }
        let added_total = match (job.expected_size, response.content_length) {
            (None, Some(announced)) => {
                aggregate.total.fetch_add(announced, Ordering::SeqCst);
                announced
            }
            _ => 0,
        };
        let total = job.expected_size.or(response.content_length);

        let part = partial_path(&job.dest);
        let mut received = 0u64;
        let written = self
            .write_body(index, job, response.body, &part, total, aggregate, &mut received)
            .await;

        let sha256 = match written {
            Ok(sha256) => sha256,
            Err(err) => {
                let _ = tokio::fs::remove_file(&part).await;
                aggregate.rollback(received, added_total);
                return Err(err);
            }
        };
        if let Err(err) = tokio::fs::rename(&part, &job.dest).await {
            let _ = tokio::fs::remove_file(&part).await;
            aggregate.rollback(received, added_total);
            return Err(err.into());
        }

        Ok(CompletedDownload {
            path: job.dest.clone(),
            bytes: received,
            source_url: url.to_owned(),
            used_fallback: false,
            sha256,
            finished_at: Utc::now().to_rfc3339(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_body(
        &self,
        index: usize,
        job: &DownloadJob,
        mut body: BoxStream<'static, Result<Bytes, TransportError>>,
        part: &Path,
        total: Option<u64>,
        aggregate: &Aggregate,
        received: &mut u64,
    ) -> Result<Option<String>, Error> {
        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(part).await?;
        let mut hasher = job.checksum.as_ref().map(|_| Sha256::new());
        let timeout = self.session.limits().transfer_timeout();
        let mut last_tick = Instant::now();
        let mut last_bytes = 0u64;

        loop {
            let next = self
                .session
                .guard(timeout, async { Ok::<_, TransportError>(body.next().await) })
                .await?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            *received += chunk.len() as u64;
            aggregate.add(chunk.len() as u64);

            if let Some(expected) = total
                && *received > expected
            {
                return Err(Error::SizeMismatch {
                    expected,
                    actual: *received,
                });
            }

            let elapsed = last_tick.elapsed().as_secs_f32();
            if elapsed > 0.2 {
                let speed = (*received - last_bytes) as f32 / elapsed;
                self.emit(DownloadEvent::Progress {
                    index,
                    downloaded: *received,
                    total,
                    speed: format_speed(speed),
                    aggregate: aggregate.snapshot(),
                });
                last_tick = Instant::now();
                last_bytes = *received;
            }
        }
        file.flush().await?;
        drop(file);

        self.emit(DownloadEvent::Progress {
            index,
            downloaded: *received,
            total,
            speed: "0 B/s".into(),
            aggregate: aggregate.snapshot(),
        });

        if let Some(expected) = total
            && *received != expected
        {
            return Err(Error::SizeMismatch {
                expected,
                actual: *received,
            });
        }

        match (hasher, job.checksum.as_deref()) {
            (Some(hasher), Some(expected)) => {
                let actual = format!("{:x}", hasher.finalize());
                if actual != expected {
                    warn!(
                        "download: {} failed integrity check, discarding",
                        job.item.name
                    );
                    return Err(Error::ChecksumMismatch {
                        expected: expected.to_owned(),
                        actual,
                    });
                }
                Ok(Some(actual))
            }
            _ => Ok(None),
        }
    }
}

fn unique_destinations(jobs: &mut [DownloadJob]) {
    let mut taken = HashSet::new();
    for job in jobs.iter_mut() {
        let mut dest = job.dest.clone();
        let mut n = 0;
        while !taken.insert(dest.to_string_lossy().to_lowercase()) {
            n += 1;
            dest = numbered(&job.dest, n);
        }
        if n > 0 {
            warn!(
                "download: {} collides with an earlier file, saving as {}",
                job.item.name,
                dest.display()
            );
            job.dest = dest;
        }
    }
}

/// `dir/a.pdf` becomes `dir/a (n).pdf`.
fn numbered(dest: &Path, n: usize) -> PathBuf {
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match dest.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    };
    dest.with_file_name(name)
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures_util::stream;

    use super::*;
    use crate::config::Limits;
    use crate::networking::FetchResponse;

    enum Route {
        Serve(Vec<u8>),
        Announce(Vec<u8>, Option<u64>),
        Fail(TransportError),
        Hang,
        Slow(Vec<u8>),
        /// Sends the first bytes, then nothing more.
        Stall(Vec<u8>, u64),
        /// Cancels the session, then never answers.
        CancelAndHang(Session),
    }

    #[derive(Default)]
    struct MockFetcher {
        routes: HashMap<String, Route>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockFetcher {
        fn route(mut self, url: &str, route: Route) -> Self {
            self.routes.insert(url.into(), route);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn body(bytes: &[u8], length: Option<u64>) -> FetchResponse {
        let chunks: Vec<Result<Bytes, TransportError>> = bytes
            .chunks(4)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        FetchResponse {
            content_length: length,
            body: stream::iter(chunks).boxed(),
        }
    }

    impl ContentFetcher for MockFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchResponse, TransportError> {
            self.calls.lock().unwrap().push(url.to_owned());
            match self.routes.get(url) {
                None => Err(TransportError::NotFound),
                Some(Route::Serve(bytes)) => Ok(body(bytes, Some(bytes.len() as u64))),
                Some(Route::Announce(bytes, length)) => Ok(body(bytes, *length)),
                Some(Route::Fail(err)) => Err(err.clone()),
                Some(Route::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(TransportError::Timeout)
                }
                Some(Route::Stall(bytes, length)) => {
                    let first = stream::iter(vec![Ok(Bytes::copy_from_slice(bytes))]);
                    Ok(FetchResponse {
                        content_length: Some(*length),
                        body: first.chain(stream::pending()).boxed(),
                    })
                }
                Some(Route::CancelAndHang(session)) => {
                    session.cancel();
                    std::future::pending().await
                }
                Some(Route::Slow(bytes)) => {
                    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    self.peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(body(bytes, Some(bytes.len() as u64)))
                }
            }
        }
    }

    fn leaf(name: &str, size: u64) -> FileLeaf {
        FileLeaf {
            name: name.into(),
            path: format!("exams/{name}"),
            size,
            origin_url: format!("https://origin.test/{name}"),
            mirror_url: format!("https://mirror.test/{name}"),
        }
    }

    fn session() -> Session {
        Session::new(Limits {
            requests_per_minute: 0,
            ..Limits::default()
        })
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    fn update_check(url: &str, checksum: &str) -> CheckResult {
        CheckResult {
            has_update: true,
            remote_ver: "2.0.0".into(),
            download_url: url.into(),
            checksum: checksum.into(),
            ..CheckResult::default()
        }
    }

    #[test]
    fn file_jobs_use_mirror_first_and_keep_relative_layout() {
        let dir = Path::new("/tmp/out");
        let mut file = leaf("a?.pdf", 3);
        file.path = "exams/2023/a?.pdf".into();

        let job = DownloadJob::for_file(&file, dir, "exams", FileKey::Mirror);
        assert_eq!(job.item.url, "https://mirror.test/a?.pdf");
        assert_eq!(job.fallback_url.as_deref(), Some("https://origin.test/a?.pdf"));
        assert_eq!(job.dest, dir.join("2023").join("a_.pdf"));

        let job = DownloadJob::for_file(&file, dir, "exams", FileKey::Origin);
        assert_eq!(job.item.url, "https://origin.test/a?.pdf");
        assert_eq!(job.fallback_url.as_deref(), Some("https://mirror.test/a?.pdf"));

        let mut same = leaf("b.pdf", 1);
        same.mirror_url = same.origin_url.clone();
        assert!(DownloadJob::for_file(&same, dir, "", FileKey::Mirror).fallback_url.is_none());
    }

    #[test]
    fn update_jobs_require_url_and_checksum() {
        let dest = PathBuf::from("/tmp/update");
        assert!(DownloadJob::for_update(&update_check("", "ab"), dest.clone()).is_err());
        assert!(DownloadJob::for_update(&update_check("https://x", " "), dest.clone()).is_err());
        let job = DownloadJob::for_update(&update_check("https://x", "AB"), dest).unwrap();
        assert_eq!(job.checksum.as_deref(), Some("ab"));
        assert!(job.fallback_url.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_origin_when_mirror_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::default()
            .route("https://mirror.test/a.pdf", Route::Hang)
            .route("https://origin.test/a.pdf", Route::Serve(b"exam paper".to_vec()));
        let session = session();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let report = DownloadManager::new(&fetcher, &session)
            .with_events(tx)
            .download_all(vec![DownloadJob::for_file(
                &leaf("a.pdf", 10),
                dir.path(),
                "exams",
                FileKey::Mirror,
            )])
            .await;

        let (_, done) = report.succeeded().next().unwrap();
        assert!(done.used_fallback);
        assert_eq!(done.source_url, "https://origin.test/a.pdf");
        assert_eq!(std::fs::read(dir.path().join("a.pdf")).unwrap(), b"exam paper");
        assert_eq!(report.fallback_count(), 1);
        assert!(report.is_complete());

        let mut saw_fallback = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, DownloadEvent::FallingBack { .. }) {
                saw_fallback = true;
            }
        }
        assert!(saw_fallback);
    }

    #[tokio::test]
    async fn size_mismatch_triggers_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::default()
            .route("https://mirror.test/a.pdf", Route::Announce(b"short".to_vec(), None))
            .route("https://origin.test/a.pdf", Route::Serve(b"0123456789".to_vec()));
        let session = session();

        let report = DownloadManager::new(&fetcher, &session)
            .download_all(vec![DownloadJob::for_file(
                &leaf("a.pdf", 10),
                dir.path(),
                "exams",
                FileKey::Mirror,
            )])
            .await;

        let (_, done) = report.succeeded().next().unwrap();
        assert!(done.used_fallback);
        assert_eq!(done.bytes, 10);
        assert!(!partial_path(&dir.path().join("a.pdf")).exists());
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::default()
            .route("https://mirror.test/a.pdf", Route::Serve(b"aaaa".to_vec()))
            .route("https://mirror.test/b.pdf", Route::Fail(TransportError::Status(502)))
            .route("https://origin.test/b.pdf", Route::Fail(TransportError::NotFound))
            .route("https://mirror.test/c.pdf", Route::Serve(b"cc".to_vec()));
        let session = session();
        let jobs = vec![
            DownloadJob::for_file(&leaf("a.pdf", 4), dir.path(), "exams", FileKey::Mirror),
            DownloadJob::for_file(&leaf("b.pdf", 9), dir.path(), "exams", FileKey::Mirror),
            DownloadJob::for_file(&leaf("c.pdf", 2), dir.path(), "exams", FileKey::Mirror),
        ];

        let report = DownloadManager::new(&fetcher, &session).download_all(jobs).await;

        assert_eq!(report.outcomes.len(), 3);
        assert!(report.outcomes[0].result.is_ok());
        assert!(matches!(
            report.outcomes[1].result,
            Err(Error::DownloadFailed { .. })
        ));
        assert!(report.outcomes[2].result.is_ok());
        assert!(!report.is_complete());
        assert!(dir.path().join("c.pdf").exists());
        assert!(!dir.path().join("b.pdf").exists());
    }

    #[tokio::test]
    async fn reports_aggregate_progress() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::default()
            .route("https://mirror.test/a.pdf", Route::Serve(vec![1; 12]))
            .route("https://mirror.test/b.pdf", Route::Serve(vec![2; 6]));
        let session = session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let jobs = vec![
            DownloadJob::for_file(&leaf("a.pdf", 12), dir.path(), "exams", FileKey::Mirror),
            DownloadJob::for_file(&leaf("b.pdf", 6), dir.path(), "exams", FileKey::Mirror),
        ];

        DownloadManager::new(&fetcher, &session)
            .with_events(tx)
            .download_all(jobs)
            .await;

        let mut last = AggregateProgress::default();
        let mut finished = 0;
        while let Ok(event) = rx.try_recv() {
            if let DownloadEvent::Finished { aggregate, ok, .. } = event {
                assert!(ok);
                finished += 1;
                last = aggregate;
            }
        }
        assert_eq!(finished, 2);
        assert_eq!(last.total_bytes, 18);
        assert_eq!(last.completed_bytes, 18);
    }

    #[tokio::test]
    async fn verifies_update_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = b"new binary".to_vec();
        let fetcher =
            MockFetcher::default().route("https://dl.test/app", Route::Serve(artifact.clone()));
        let session = session();
        let check = update_check("https://dl.test/app", &sha256_hex(&artifact).to_uppercase());
        let job = DownloadJob::for_update(&check, dir.path().join("update.bin")).unwrap();

        let done = DownloadManager::new(&fetcher, &session)
            .download_update(job)
            .await
            .unwrap();

        assert_eq!(done.sha256.as_deref(), Some(sha256_hex(&artifact).as_str()));
        assert_eq!(std::fs::read(&done.path).unwrap(), artifact);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_fatal_and_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::default()
            .route("https://dl.test/app", Route::Serve(b"tampered".to_vec()))
            .route("https://backup.test/app", Route::Serve(b"tampered".to_vec()));
        let session = session();
        let check = update_check("https://dl.test/app", &sha256_hex(b"genuine"));
        let mut job = DownloadJob::for_update(&check, dir.path().join("update.bin")).unwrap();
        job.fallback_url = Some("https://backup.test/app".into());

        let err = DownloadManager::new(&fetcher, &session)
            .download_update(job)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert_eq!(fetcher.calls(), vec!["https://dl.test/app".to_owned()]);
        assert!(!dir.path().join("update.bin").exists());
        assert!(!dir.path().join("update.bin.part").exists());
    }

    #[tokio::test]
    async fn cancelled_session_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::default();
        let session = session();
        session.cancel();

        let report = DownloadManager::new(&fetcher, &session)
            .download_all(vec![DownloadJob::for_file(
                &leaf("a.pdf", 1),
                dir.path(),
                "",
                FileKey::Mirror,
            )])
            .await;

        assert!(report.cancelled);
        assert!(matches!(report.outcomes[0].result, Err(Error::Cancelled)));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn respects_worker_pool_bound() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = MockFetcher::default();
        let mut jobs = Vec::new();
        for i in 0..6 {
            let name = format!("{i}.pdf");
            fetcher = fetcher.route(&format!("https://mirror.test/{name}"), Route::Slow(vec![0; 3]));
            jobs.push(DownloadJob::for_file(&leaf(&name, 3), dir.path(), "exams", FileKey::Mirror));
        }
        let session = Session::new(Limits {
            workers: 2,
            requests_per_minute: 0,
            ..Limits::default()
        });

        let report = DownloadManager::new(&fetcher, &session).download_all(jobs).await;

        assert!(report.is_complete());
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
        assert!(fetcher.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn colliding_names_get_numbered_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::default()
            .route("https://mirror.test/a?.pdf", Route::Serve(b"first".to_vec()))
            .route("https://mirror.test/a*.pdf", Route::Serve(b"second".to_vec()));
        let session = session();
        let jobs = vec![
            DownloadJob::for_file(&leaf("a?.pdf", 5), dir.path(), "exams", FileKey::Mirror),
            DownloadJob::for_file(&leaf("a*.pdf", 6), dir.path(), "exams", FileKey::Mirror),
        ];
        assert_eq!(jobs[0].dest, jobs[1].dest);

        let report = DownloadManager::new(&fetcher, &session).download_all(jobs).await;

        assert!(report.is_complete());
        let paths: Vec<PathBuf> = report.succeeded().map(|(_, done)| done.path.clone()).collect();
        assert_eq!(paths, vec![dir.path().join("a_.pdf"), dir.path().join("a_ (1).pdf")]);
        assert_eq!(std::fs::read(dir.path().join("a_.pdf")).unwrap(), b"first");
        assert_eq!(std::fs::read(dir.path().join("a_ (1).pdf")).unwrap(), b"second");
    }

    #[test]
    fn numbers_names_with_and_without_extension() {
        assert_eq!(numbered(Path::new("/x/a.pdf"), 2), PathBuf::from("/x/a (2).pdf"));
        assert_eq!(numbered(Path::new("/x/README"), 1), PathBuf::from("/x/README (1)"));
    }

    #[tokio::test]
    async fn cancelling_mid_batch_keeps_finished_files() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(Limits {
            workers: 1,
            requests_per_minute: 0,
            ..Limits::default()
        });
        let fetcher = MockFetcher::default()
            .route("https://mirror.test/a.pdf", Route::Serve(b"done".to_vec()))
            .route("https://mirror.test/b.pdf", Route::CancelAndHang(session.clone()))
            .route("https://mirror.test/c.pdf", Route::Serve(b"never".to_vec()));
        let jobs = ["a.pdf", "b.pdf", "c.pdf"]
            .iter()
            .map(|name| DownloadJob::for_file(&leaf(name, 4), dir.path(), "exams", FileKey::Mirror))
            .collect();

        let report = DownloadManager::new(&fetcher, &session).download_all(jobs).await;

        assert!(report.cancelled);
        assert!(!report.is_complete());
        assert!(report.outcomes[0].result.is_ok());
        assert_eq!(std::fs::read(dir.path().join("a.pdf")).unwrap(), b"done");
        assert!(matches!(report.outcomes[1].result, Err(Error::Cancelled)));
        assert!(matches!(report.outcomes[2].result, Err(Error::Cancelled)));
        assert!(!dir.path().join("b.pdf").exists());
        assert!(!dir.path().join("c.pdf").exists());
        assert!(!fetcher.calls().iter().any(|url| url.starts_with("https://origin.test")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_stalled_body() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::default()
            .route("https://mirror.test/a.pdf", Route::Stall(b"half".to_vec(), 8));
        let session = session();
        let canceller = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let started = tokio::time::Instant::now();

        let report = DownloadManager::new(&fetcher, &session)
            .download_all(vec![DownloadJob::for_file(
                &leaf("a.pdf", 8),
                dir.path(),
                "exams",
                FileKey::Mirror,
            )])
            .await;

        assert!(matches!(report.outcomes[0].result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Limits::default().transfer_timeout());
        assert_eq!(fetcher.calls(), vec!["https://mirror.test/a.pdf".to_owned()]);
        assert!(!partial_path(&dir.path().join("a.pdf")).exists());
    }
}
