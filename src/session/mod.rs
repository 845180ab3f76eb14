//! Process-wide request budget shared by tree builds, update checks and
//! downloads.
//!
//! A [`Session`] owns three things:
//! - a semaphore bounding how many host requests are in flight at once,
//! - a token bucket keeping listing queries under the host's request quota,
//! - a cancellation flag observed by every long-running operation.
//!
//! Sessions are cheap to clone; all clones share the same state. Call
//! [`Session::shutdown`] when the application is done with it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{Notify, Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::config::{AppConfig, Limits};
use crate::error::{Error, TransportError};

const MAX_LIMITER_NAP: Duration = Duration::from_millis(250);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Semaphore,
    limiter: RateLimiter,
    cancel: AtomicBool,
    cancelled: Notify,
    limits: Limits,
}

impl Session {
    pub fn new(limits: Limits) -> Self {
        let limiter = RateLimiter::per_minute(limits.requests_per_minute);
        Self::with_limiter(limits, limiter)
    }

    /// A session for `config`. Without a token the host's anonymous quota
    /// applies to listings.
    pub fn for_config(config: &AppConfig) -> Self {
        let limits = config.limits.clone();
        if config.github_token.is_some() {
            return Self::new(limits);
        }
        debug!(
            "session: no token, limiting listings to {} per hour",
            limits.anonymous_requests_per_hour
        );
        let limiter = RateLimiter::new(limits.anonymous_requests_per_hour, HOUR);
        Self::with_limiter(limits, limiter)
    }

    fn with_limiter(limits: Limits, limiter: RateLimiter) -> Self {
        debug!("session: {} workers", limits.workers);
        Self {
            inner: Arc::new(Inner {
                pool: Semaphore::new(limits.workers.max(1)),
                limiter,
                cancel: AtomicBool::new(false),
                cancelled: Notify::new(),
                limits,
            }),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.inner.limits
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn cancel(&self) {
        if !self.inner.cancel.swap(true, Ordering::SeqCst) {
            warn!("session: cancellation requested");
        }
        self.inner.cancelled.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.load(Ordering::SeqCst)
    }

    /// Resolves once the session is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.cancelled.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Run one host call bounded by `limit`, abandoning it as soon as the
    /// session is cancelled. An expired limit is a [`TransportError::Timeout`].
    pub async fn guard<T>(
        &self,
        limit: Duration,
        call: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, Error> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(limit, call) => match result {
                Ok(result) => result.map_err(Error::from),
                Err(_) => Err(TransportError::Timeout.into()),
            },
        }
    }

    /// Cancel outstanding work and refuse any further permits.
    pub fn shutdown(&self) {
        self.cancel();
        self.inner.pool.close();
        debug!("session: worker pool closed");
    }

    /// Wait for a worker slot and a rate-limit token for one listing query.
    pub async fn acquire_listing(&self) -> Result<SemaphorePermit<'_>, Error> {
        self.inner.limiter.acquire(&self.inner.cancel).await?;
        self.acquire_transfer().await
    }

    /// Wait for a worker slot for a fetch that does not count against the
    /// listing quota.
    pub async fn acquire_transfer(&self) -> Result<SemaphorePermit<'_>, Error> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let permit = tokio::select! {
            biased;
            _ = self.cancelled() => return Err(Error::Cancelled),
            permit = self.inner.pool.acquire() => permit.map_err(|_| Error::Cancelled)?,
        };
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(permit)
    }
}

/// Token bucket refilled continuously at a fixed rate.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    capacity: f64,
    refill_per_sec: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    paused_until: Option<Instant>,
}

impl RateLimiter {
    /// `requests` per `window`, starting full. `0` disables limiting.
    pub fn new(requests: u32, window: Duration) -> Self {
        let capacity = f64::from(requests);
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
                paused_until: None,
            }),
            capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(1.0),
        }
    }

    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }

    fn unlimited(&self) -> bool {
        self.capacity <= 0.0
    }

    /// Take one token, or report how long until one is available.
    pub fn try_take(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        if let Some(until) = bucket.paused_until {
            if now < until {
                return Err(until - now);
            }
            bucket.paused_until = None;
        }
        if self.unlimited() {
            return Ok(());
        }
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    /// Empty the bucket and hold every listing for `wait`, after the host
    /// reported its quota as exhausted.
    pub fn pause(&self, wait: Duration) {
        let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        bucket.tokens = 0.0;
        bucket.last_refill = now;
        let until = now + wait;
        if bucket.paused_until.is_none_or(|current| current < until) {
            bucket.paused_until = Some(until);
        }
        warn!(
            "session: host quota exhausted, holding listing requests for {:?}",
            wait
        );
    }

    async fn acquire(&self, cancel: &AtomicBool) -> Result<(), Error> {
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            match self.try_take() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    debug!("session: rate limited, waiting {:?}", wait);
                    tokio::time::sleep(wait.min(MAX_LIMITER_NAP)).await;
                }
            }
        }
    }
}
