//! src/services/url_cache.rs
//!
//! SignedUrlCache: document id -> time-limited access URL, refreshed ahead of
//! expiry by a single timer per cache.
//!
//! Entries are indexed twice: by id, and in an ordered set keyed by
//! `(expires_at, id)`. The first element of that set is the only thing the
//! refresher task looks at to arm its timer; every mutation pokes the task
//! through a `Notify` so it re-arms.

use crate::{
    models::signed_url::{SignedUrl, SignedUrlEntry},
    services::remote::{MetadataError, MetadataRepository, ObjectStorage, StorageError},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Error)]
pub enum UrlIssueError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Remote "issue URL" operation, keyed by document id.
#[async_trait]
pub trait UrlIssuer: Send + Sync {
    /// Issue URLs for `document_ids` in one request.
    ///
    /// `Err` means the whole batch failed. Ids missing from the returned map
    /// failed individually.
    async fn issue_urls(
        &self,
        document_ids: &[String],
        ttl: Duration,
    ) -> Result<HashMap<String, SignedUrl>, UrlIssueError>;
}

/// Issues URLs by looking up each document's remote path in the metadata
/// repository and signing all paths in one storage call.
pub struct MetadataUrlIssuer {
    metadata: Arc<dyn MetadataRepository>,
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
}

impl MetadataUrlIssuer {
    pub fn new(
        metadata: Arc<dyn MetadataRepository>,
        storage: Arc<dyn ObjectStorage>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            metadata,
            storage,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl UrlIssuer for MetadataUrlIssuer {
    async fn issue_urls(
        &self,
        document_ids: &[String],
        ttl: Duration,
    ) -> Result<HashMap<String, SignedUrl>, UrlIssueError> {
        let records = self.metadata.get_document_records(document_ids).await?;

        let mut ids_by_path: HashMap<String, Vec<String>> = HashMap::new();
        for record in records {
            ids_by_path
                .entry(record.remote_path)
                .or_default()
                .push(record.id);
        }
        let paths: Vec<String> = ids_by_path.keys().cloned().collect();
        if paths.is_empty() {
            return Ok(HashMap::new());
        }

        let signed = self
            .storage
            .issue_signed_urls(&self.bucket, &paths, ttl)
            .await?;

        let mut issued = HashMap::new();
        for (path, result) in signed {
            match result {
                Ok(url) => {
                    for id in ids_by_path.get(&path).into_iter().flatten() {
                        issued.insert(id.clone(), url.clone());
                    }
                }
                Err(err) => warn!(path = %path, error = %err, "could not sign document url"),
            }
        }
        Ok(issued)
    }
}

#[derive(Clone, Debug)]
pub struct UrlCacheConfig {
    /// How long before expiry an entry stops being handed out as fresh.
    pub refresh_buffer: Duration,
    /// Lifetime requested for newly issued URLs.
    pub ttl: Duration,
    /// Run the background refresher.
    pub auto_refresh: bool,
    /// Minimum wait before the timer fires again after a refresh that left
    /// entries due.
    pub failure_backoff: Duration,
}

impl Default for UrlCacheConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_millis(300_000),
            ttl: Duration::from_secs(3600),
            auto_refresh: true,
            failure_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, SignedUrlEntry>,
    by_expiry: BTreeSet<(DateTime<Utc>, String)>,
    retry_after: Option<DateTime<Utc>>,
}

impl CacheState {
    fn put(&mut self, entry: SignedUrlEntry) {
        if let Some(old) = self.entries.get(&entry.document_id) {
            self.by_expiry
                .remove(&(old.expires_at, old.document_id.clone()));
        }
        self.by_expiry
            .insert((entry.expires_at, entry.document_id.clone()));
        self.entries.insert(entry.document_id.clone(), entry);
    }
}

struct CacheInner {
    issuer: Arc<dyn UrlIssuer>,
    clock: Arc<dyn Clock>,
    config: UrlCacheConfig,
    state: Mutex<CacheState>,
    rearm: Notify,
}

pub struct SignedUrlCache {
    inner: Arc<CacheInner>,
    shutdown: CancellationToken,
}

impl SignedUrlCache {
    /// Build a cache on the system clock. With `auto_refresh` set this spawns
    /// the refresher, so it must be called from within a Tokio runtime.
    pub fn new(issuer: Arc<dyn UrlIssuer>, config: UrlCacheConfig) -> Self {
        Self::with_clock(issuer, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        issuer: Arc<dyn UrlIssuer>,
        clock: Arc<dyn Clock>,
        config: UrlCacheConfig,
    ) -> Self {
        let inner = Arc::new(CacheInner {
            issuer,
            clock,
            config,
            state: Mutex::new(CacheState::default()),
            rearm: Notify::new(),
        });
        let shutdown = CancellationToken::new();
        if inner.config.auto_refresh {
            tokio::spawn(run_refresher(inner.clone(), shutdown.clone()));
        }
        Self { inner, shutdown }
    }

    /// URLs for `document_ids`, fetching every missing or stale one in a
    /// single batched request.
    ///
    /// Ids the issuer fails on are absent from the result. A stale entry
    /// stays cached, so `get` and `is_expired` still report it.
    pub async fn resolve<I>(&self, document_ids: I) -> HashMap<String, SignedUrl>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let now = self.inner.clock.now();
        let buffer = self.inner.buffer();
        let mut wanted: Vec<String> = document_ids.into_iter().map(Into::into).collect();
        wanted.sort();
        wanted.dedup();

        let mut resolved = HashMap::new();
        let mut to_fetch = Vec::new();
        {
            let state = self.inner.state.lock();
            for id in wanted {
                match state.entries.get(&id) {
                    Some(entry) if entry.is_fresh(now, buffer) => {
                        resolved.insert(id, entry.as_signed_url());
                    }
                    _ => to_fetch.push(id),
                }
            }
        }
        if to_fetch.is_empty() {
            return resolved;
        }

        debug!(requested = to_fetch.len(), "issuing signed url batch");
        let issued = match self.inner.issuer.issue_urls(&to_fetch, self.inner.config.ttl).await {
            Ok(issued) => self.inner.store(issued, now),
            Err(err) => {
                warn!(requested = to_fetch.len(), error = %err, "signed url batch failed");
                HashMap::new()
            }
        };

        for id in to_fetch {
            if let Some(url) = issued.get(&id) {
                resolved.insert(id, url.clone());
            } else {
                debug!(document_id = %id, "no signed url available");
            }
        }
        resolved
    }

    /// Re-issue the URL for one document. Returns whether it succeeded.
    pub async fn refresh_one(&self, document_id: &str) -> bool {
        let now = self.inner.clock.now();
        let ids = [document_id.to_string()];
        match self.inner.issuer.issue_urls(&ids, self.inner.config.ttl).await {
            Ok(issued) => {
                let stored = self.inner.store(issued, now);
                if stored.contains_key(document_id) {
                    true
                } else {
                    warn!(document_id = %document_id, "signed url refresh returned nothing");
                    false
                }
            }
            Err(err) => {
                warn!(document_id = %document_id, error = %err, "signed url refresh failed");
                false
            }
        }
    }

    /// Refresh, in one batch, every entry expiring within `buffer` of now.
    /// Returns how many entries were refreshed.
    pub async fn refresh_expiring(&self, buffer: Duration) -> usize {
        self.inner.refresh_expiring(buffer).await
    }

    /// True if there is no entry for the id or it expires within `buffer`.
    pub fn is_expired(&self, document_id: &str, buffer: Duration) -> bool {
        let horizon = self.inner.clock.now() + to_chrono(buffer);
        self.inner
            .state
            .lock()
            .entries
            .get(document_id)
            .is_none_or(|entry| entry.expires_at <= horizon)
    }

    pub fn get(&self, document_id: &str) -> Option<SignedUrlEntry> {
        self.inner.state.lock().entries.get(document_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// When the refresh timer is (or would next be) armed to fire. `None` if
    /// the cache is empty or auto-refresh is off.
    pub fn next_refresh_at(&self) -> Option<DateTime<Utc>> {
        if !self.inner.config.auto_refresh {
            return None;
        }
        self.inner.next_refresh_at()
    }
}

impl Drop for SignedUrlCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl CacheInner {
    fn buffer(&self) -> chrono::Duration {
        to_chrono(self.config.refresh_buffer)
    }

    fn next_refresh_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock();
        let (earliest, _) = state.by_expiry.first()?;
        let fire_at = *earliest - self.buffer();
        Some(match state.retry_after {
            Some(retry_after) if retry_after > fire_at => retry_after,
            _ => fire_at,
        })
    }

    /// Write issued URLs into the cache and re-arm the timer. URLs that are
    /// already expired at issue time are dropped.
    fn store(
        &self,
        issued: HashMap<String, SignedUrl>,
        issued_at: DateTime<Utc>,
    ) -> HashMap<String, SignedUrl> {
        let mut stored = HashMap::new();
        {
            let mut state = self.state.lock();
            for (id, url) in issued {
                if url.expires_at <= issued_at {
                    warn!(document_id = %id, expires_at = %url.expires_at, "issuer returned an expired url");
                    continue;
                }
                state.put(SignedUrlEntry::new(id.clone(), url.clone(), issued_at));
                stored.insert(id, url);
            }
            let horizon = issued_at + self.buffer();
            if !stored.is_empty()
                && state
                    .by_expiry
                    .first()
                    .is_none_or(|(expires_at, _)| *expires_at > horizon)
            {
                state.retry_after = None;
            }
        }
        if !stored.is_empty() {
            self.rearm.notify_one();
        }
        stored
    }

    async fn refresh_expiring(&self, buffer: Duration) -> usize {
        let now = self.clock.now();
        let horizon = now + to_chrono(buffer);
        let due: Vec<String> = self
            .state
            .lock()
            .by_expiry
            .iter()
            .take_while(|(expires_at, _)| *expires_at <= horizon)
            .map(|(_, id)| id.clone())
            .collect();
        if due.is_empty() {
            return 0;
        }

        let refreshed = match self.issuer.issue_urls(&due, self.config.ttl).await {
            Ok(issued) => self.store(issued, now),
            Err(err) => {
                warn!(due = due.len(), error = %err, "signed url refresh batch failed");
                HashMap::new()
            }
        };

        let still_due = due
            .iter()
            .filter(|id| refreshed.get(*id).is_none_or(|url| url.expires_at <= horizon))
            .count();
        {
            let mut state = self.state.lock();
            state.retry_after = if still_due > 0 {
                Some(self.clock.now() + to_chrono(self.config.failure_backoff))
            } else {
                None
            };
        }
        self.rearm.notify_one();

        if still_due > 0 {
            warn!(
                due = due.len(),
                refreshed = refreshed.len(),
                still_due,
                "signed url refresh left entries due, backing off"
            );
        } else {
            info!(refreshed = refreshed.len(), "signed urls refreshed");
        }
        refreshed.len()
    }
}

/// The one timer of a cache: sleeps until the earliest expiry minus the
/// buffer, refreshes, re-arms. Any mutation wakes it to re-arm early.
async fn run_refresher(inner: Arc<CacheInner>, shutdown: CancellationToken) {
    loop {
        let Some(fire_at) = inner.next_refresh_at() else {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = inner.rearm.notified() => continue,
            }
        };

        // A fire time in the past yields a zero wait: refresh immediately.
        let wait = (fire_at - inner.clock.now()).to_std().unwrap_or(Duration::ZERO);
        debug!(fire_at = %fire_at, wait_ms = wait.as_millis() as u64, "refresh timer armed");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = inner.rearm.notified() => continue,
            _ = tokio::time::sleep(wait) => {
                inner.refresh_expiring(inner.config.refresh_buffer).await;
            }
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
