//! src/services/upload_manager.rs
//!
//! UploadManager: drives one transfer per document id to completion against
//! an `ObjectStorage`, retrying transient failures and honouring pause,
//! resume and cancel.
//!
//! Each run is a spawned task. The caller gets an [`UploadHandle`] carrying a
//! progress channel (non-decreasing percentages) and a one-shot outcome that
//! resolves exactly once, after the last progress value has been sent.
//!
//! The task table is guarded by a mutex; every state transition goes through
//! it and is tagged with the run that made it, so a run that is still
//! winding down after a pause cannot clobber the run that resumed it.

use crate::{
    errors::TransferError,
    models::{
        storage::UploadOptions,
        upload::{Destination, UploadConfig, UploadPayload, UploadResult, UploadState, UploadStatus},
    },
    services::remote::ObjectStorage,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Caller side of one upload run.
#[derive(Debug)]
pub struct UploadHandle {
    document_id: String,
    progress: mpsc::UnboundedReceiver<u8>,
    outcome: oneshot::Receiver<Result<UploadResult, TransferError>>,
}

impl UploadHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Next progress percentage, or `None` once the run has finished.
    pub async fn next_progress(&mut self) -> Option<u8> {
        self.progress.recv().await
    }

    /// Wait for the terminal outcome of this run.
    pub async fn finish(self) -> Result<UploadResult, TransferError> {
        self.outcome.await.unwrap_or(Err(TransferError::Cancelled))
    }

    /// Drain every progress value, then return them with the outcome.
    pub async fn collect(mut self) -> (Vec<u8>, Result<UploadResult, TransferError>) {
        let mut seen = Vec::new();
        while let Some(pct) = self.progress.recv().await {
            seen.push(pct);
        }
        (seen, self.finish().await)
    }
}

struct TaskEntry {
    run_id: u64,
    payload: UploadPayload,
    destination: Destination,
    config: UploadConfig,
    state: UploadState,
    retry_count: u32,
    progress: u8,
    paused: bool,
    cancel: CancellationToken,
}

struct ManagerInner {
    storage: Arc<dyn ObjectStorage>,
    defaults: UploadConfig,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    runs: AtomicU64,
}

/// Owns every live upload task. Dropping the manager cancels them all.
pub struct UploadManager {
    inner: Arc<ManagerInner>,
}

impl UploadManager {
    pub fn new(storage: Arc<dyn ObjectStorage>, defaults: UploadConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                storage,
                defaults,
                tasks: Mutex::new(HashMap::new()),
                runs: AtomicU64::new(0),
            }),
        }
    }

    /// Start uploading `payload` to `destination` under `document_id`.
    ///
    /// Rejected with `AlreadyActive` when a task for the id exists, including
    /// a paused one; the existing task is left untouched. Payload validation
    /// belongs to the caller (see `UploadPolicy`). Must be called from
    /// within a Tokio runtime.
    pub fn start_upload(
        &self,
        document_id: &str,
        payload: UploadPayload,
        destination: Destination,
        config: Option<UploadConfig>,
    ) -> Result<UploadHandle, TransferError> {
        let run_id = self.inner.next_run_id();
        let cancel = CancellationToken::new();
        {
            let mut tasks = self.inner.tasks.lock();
            if tasks.contains_key(document_id) {
                warn!(document_id = %document_id, "rejecting duplicate upload");
                return Err(TransferError::AlreadyActive(document_id.to_string()));
            }
            tasks.insert(
                document_id.to_string(),
                TaskEntry {
                    run_id,
                    payload,
                    destination,
                    config: config.unwrap_or_else(|| self.inner.defaults.clone()),
                    state: UploadState::Pending,
                    retry_count: 0,
                    progress: 0,
                    paused: false,
                    cancel: cancel.clone(),
                },
            );
        }

        info!(document_id = %document_id, run_id, "upload started");
        Ok(self.spawn_run(document_id, run_id, cancel))
    }

    /// Pause a running task: its in-flight attempt is aborted and no further
    /// retry happens. The task stays registered in state `Paused` until it is
    /// resumed or cancelled. No-op if no such task is running.
    pub fn pause_upload(&self, document_id: &str) {
        let mut tasks = self.inner.tasks.lock();
        let Some(entry) = tasks.get_mut(document_id) else {
            return;
        };
        if entry.paused {
            return;
        }
        entry.paused = true;
        entry.state = UploadState::Paused;
        entry.cancel.cancel();
        info!(document_id = %document_id, run_id = entry.run_id, "upload paused");
    }

    /// Restart a paused task from the first byte with a fresh cancellation
    /// token and a reset retry budget.
    pub fn resume_upload(
        &self,
        document_id: &str,
        config: Option<UploadConfig>,
    ) -> Result<UploadHandle, TransferError> {
        let run_id = self.inner.next_run_id();
        let cancel = CancellationToken::new();
        {
            let mut tasks = self.inner.tasks.lock();
            let Some(entry) = tasks.get_mut(document_id) else {
                return Err(TransferError::UnknownTask(document_id.to_string()));
            };
            if !entry.paused {
                return Err(TransferError::AlreadyActive(document_id.to_string()));
            }
            entry.run_id = run_id;
            entry.paused = false;
            entry.state = UploadState::Pending;
            entry.retry_count = 0;
            entry.progress = 0;
            entry.cancel = cancel.clone();
            if let Some(config) = config {
                entry.config = config;
            }
        }

        info!(document_id = %document_id, run_id, "upload resumed from the beginning");
        Ok(self.spawn_run(document_id, run_id, cancel))
    }

    /// Abort and forget a task regardless of its state. Returns whether a
    /// task existed.
    pub fn cancel_upload(&self, document_id: &str) -> bool {
        let removed = self.inner.tasks.lock().remove(document_id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                info!(document_id = %document_id, "upload cancelled");
                true
            }
            None => false,
        }
    }

    /// True while a transfer for the id is in progress or waiting to retry.
    pub fn is_uploading(&self, document_id: &str) -> bool {
        self.inner.tasks.lock().get(document_id).is_some_and(|entry| {
            matches!(
                entry.state,
                UploadState::Pending | UploadState::Uploading | UploadState::Retrying
            )
        })
    }

    pub fn get_upload_status(&self, document_id: &str) -> Option<UploadStatus> {
        self.inner
            .tasks
            .lock()
            .get(document_id)
            .map(|entry| UploadStatus {
                state: entry.state,
                retry_count: entry.retry_count,
                progress: entry.progress,
            })
    }

    pub fn active_uploads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.tasks.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Abort and remove every task.
    pub fn cleanup(&self) {
        let drained: Vec<(String, TaskEntry)> = self.inner.tasks.lock().drain().collect();
        for (document_id, entry) in &drained {
            entry.cancel.cancel();
            debug!(document_id = %document_id, "upload aborted during cleanup");
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "upload manager cleaned up");
        }
    }

    fn spawn_run(&self, document_id: &str, run_id: u64, cancel: CancellationToken) -> UploadHandle {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let run = UploadRun {
            inner: self.inner.clone(),
            document_id: document_id.to_string(),
            run_id,
            cancel,
            reporter: ProgressReporter {
                tx: progress_tx,
                last: Mutex::new(None),
            },
        };
        tokio::spawn(async move {
            let outcome = run.execute().await;
            // Progress sender is dropped with `run`, after the outcome is sent.
            let _ = outcome_tx.send(outcome);
            drop(run);
        });

        UploadHandle {
            document_id: document_id.to_string(),
            progress: progress_rx,
            outcome: outcome_rx,
        }
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl ManagerInner {
    fn next_run_id(&self) -> u64 {
        self.runs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Apply `f` to the entry if it still belongs to `run_id`.
    fn with_own_entry<T>(
        &self,
        document_id: &str,
        run_id: u64,
        f: impl FnOnce(&mut TaskEntry) -> T,
    ) -> Option<T> {
        let mut tasks = self.tasks.lock();
        tasks
            .get_mut(document_id)
            .filter(|entry| entry.run_id == run_id)
            .map(f)
    }

    /// Drop the entry if it still belongs to `run_id`.
    /// Remove the entry if it still belongs to `run_id`, returning its last
    /// snapshot moved into the `terminal` state.
    fn retire_own_entry(
        &self,
        document_id: &str,
        run_id: u64,
        terminal: UploadState,
    ) -> Option<UploadStatus> {
        debug_assert!(terminal.is_terminal());
        let mut tasks = self.tasks.lock();
        if !tasks
            .get(document_id)
            .is_some_and(|entry| entry.run_id == run_id)
        {
            return None;
        }
        tasks.remove(document_id).map(|entry| UploadStatus {
            state: terminal,
            retry_count: entry.retry_count,
            progress: entry.progress,
        })
    }
}

struct ProgressReporter {
    tx: mpsc::UnboundedSender<u8>,
    last: Mutex<Option<u8>>,
}

impl ProgressReporter {
    /// Send `pct` unless it would go backwards. Returns whether it was sent.
    fn emit(&self, pct: u8) -> bool {
        let mut last = self.last.lock();
        if last.is_some_and(|prev| pct <= prev) {
            return false;
        }
        *last = Some(pct);
        let _ = self.tx.send(pct);
        true
    }
}

struct UploadRun {
    inner: Arc<ManagerInner>,
    document_id: String,
    run_id: u64,
    cancel: CancellationToken,
    reporter: ProgressReporter,
}

/// What the run should do after an attempt is refused or interrupted.
enum Halt {
    Paused,
    Cancelled,
}

impl UploadRun {
    async fn execute(&self) -> Result<UploadResult, TransferError> {
        let Some((payload, destination, config)) =
            self.inner
                .with_own_entry(&self.document_id, self.run_id, |entry| {
                    (
                        entry.payload.clone(),
                        entry.destination.clone(),
                        entry.config.clone(),
                    )
                })
        else {
            return Err(TransferError::Cancelled);
        };

        self.report(0);
        let total = payload.size();
        let mut attempts: u32 = 0;

        loop {
            if let Some(halt) = self.begin_attempt() {
                return Err(self.halted(halt));
            }
            attempts += 1;
            debug!(
                document_id = %self.document_id,
                attempt = attempts,
                "upload attempt starting"
            );

            let on_bytes = |sent: u64| self.report(percent(sent, total));
            let upload = self.inner.storage.upload(
                &destination.bucket,
                &destination.path,
                payload.content.clone(),
                UploadOptions {
                    upsert: true,
                    content_type: Some(payload.mime_type.clone()),
                },
                &on_bytes,
                &self.cancel,
            );
            let result = tokio::select! {
                biased;
                res = tokio::time::timeout(config.timeout, upload) => match res {
                    Ok(res) => res.map_err(TransferError::from),
                    Err(_) => Err(TransferError::Timeout(config.timeout)),
                },
                _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            };

            let err = match result {
                Ok(uploaded) => {
                    self.report(100);
                    let last = self.inner.retire_own_entry(
                        &self.document_id,
                        self.run_id,
                        UploadState::Complete,
                    );
                    info!(
                        document_id = %self.document_id,
                        state = ?last.map(|status| status.state),
                        attempts,
                        size_bytes = uploaded.size,
                        "upload complete"
                    );
                    return Ok(UploadResult {
                        document_id: self.document_id.clone(),
                        bucket: destination.bucket.clone(),
                        path: uploaded.path,
                        size: uploaded.size,
                        etag: uploaded.etag,
                        attempts,
                    });
                }
                Err(err) => err,
            };

            if let Some(halt) = self.halt_reason() {
                return Err(self.halted(halt));
            }

            let retry_count = self
                .inner
                .with_own_entry(&self.document_id, self.run_id, |entry| entry.retry_count)
                .unwrap_or(config.max_retries);
            if !err.is_retryable() || retry_count >= config.max_retries {
                let last =
                    self.inner
                        .retire_own_entry(&self.document_id, self.run_id, UploadState::Failed);
                warn!(
                    document_id = %self.document_id,
                    state = ?last.map(|status| status.state),
                    attempts,
                    error = %err,
                    "upload failed"
                );
                return Err(err);
            }

            let retry_count = retry_count + 1;
            let delay = config.delay_for(retry_count);
            self.inner
                .with_own_entry(&self.document_id, self.run_id, |entry| {
                    if !entry.paused {
                        entry.state = UploadState::Retrying;
                        entry.retry_count = retry_count;
                    }
                });
            warn!(
                document_id = %self.document_id,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "upload attempt failed, retrying"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let halt = self.halt_reason().unwrap_or(Halt::Cancelled);
                    return Err(self.halted(halt));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Move the entry into `Uploading`, unless the run was paused or cancelled.
    fn begin_attempt(&self) -> Option<Halt> {
        if let Some(halt) = self.halt_reason() {
            return Some(halt);
        }
        match self
            .inner
            .with_own_entry(&self.document_id, self.run_id, |entry| {
                if entry.paused {
                    false
                } else {
                    entry.state = UploadState::Uploading;
                    true
                }
            }) {
            Some(true) => None,
            Some(false) => Some(Halt::Paused),
            None => Some(Halt::Cancelled),
        }
    }

    fn halt_reason(&self) -> Option<Halt> {
        let paused = self
            .inner
            .with_own_entry(&self.document_id, self.run_id, |entry| entry.paused);
        match paused {
            Some(true) => Some(Halt::Paused),
            // Entry gone or taken over by a newer run.
            None => Some(Halt::Cancelled),
            Some(false) if self.cancel.is_cancelled() => Some(Halt::Cancelled),
            Some(false) => None,
        }
    }

    fn halted(&self, halt: Halt) -> TransferError {
        match halt {
            Halt::Paused => {
                info!(document_id = %self.document_id, "upload run stopped by pause");
                TransferError::Paused
            }
            Halt::Cancelled => {
                let last = self.inner.retire_own_entry(
                    &self.document_id,
                    self.run_id,
                    UploadState::Cancelled,
                );
                info!(
                    document_id = %self.document_id,
                    state = ?last.map(|status| status.state),
                    "upload run cancelled"
                );
                TransferError::Cancelled
            }
        }
    }

    fn report(&self, pct: u8) {
        if self.reporter.emit(pct) {
            self.inner
                .with_own_entry(&self.document_id, self.run_id, |entry| {
                    entry.progress = entry.progress.max(pct);
                });
        }
    }
}

fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (sent.saturating_mul(100) / total).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{signed_url::SignedUrl, storage::*},
        services::remote::{ProgressFn, StorageError, StorageResult},
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    #[derive(Clone, Copy)]
    enum Step {
        Succeed,
        FailNetwork,
        FailPermission,
        FailReadOnly,
        /// Block until cancelled.
        Hang,
        /// Sleep, ignoring the cancellation token, then succeed.
        Slow(Duration),
    }

    struct StubStorage {
        script: Mutex<VecDeque<Step>>,
        fallback: Step,
        attempts: AtomicU32,
    }

    impl StubStorage {
        fn new(script: &[Step], fallback: Step) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                fallback,
                attempts: AtomicU32::new(0),
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ObjectStorage for StubStorage {
        async fn upload(
            &self,
            _bucket: &str,
            path: &str,
            bytes: Bytes,
            _options: UploadOptions,
            progress: ProgressFn<'_>,
            cancel: &CancellationToken,
        ) -> StorageResult<UploadedObject> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().pop_front().unwrap_or(self.fallback);
            match step {
                Step::Succeed => {}
                Step::FailNetwork => return Err(StorageError::Network("connection reset".into())),
                Step::FailPermission => {
                    return Err(StorageError::PermissionDenied("bucket policy".into()));
                }
                Step::FailReadOnly => {
                    return Err(StorageError::Io(std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "read-only",
                    )));
                }
                Step::Hang => {
                    cancel.cancelled().await;
                    return Err(StorageError::Cancelled);
                }
                Step::Slow(duration) => tokio::time::sleep(duration).await,
            }
            let half = bytes.len() as u64 / 2;
            progress(half);
            progress(bytes.len() as u64);
            Ok(UploadedObject {
                path: path.to_string(),
                size: bytes.len() as u64,
                etag: None,
            })
        }

        async fn issue_signed_url(
            &self,
            _bucket: &str,
            _path: &str,
            _ttl: Duration,
        ) -> StorageResult<SignedUrl> {
            unimplemented!("not used by the upload manager")
        }

        async fn issue_signed_urls(
            &self,
            _bucket: &str,
            _paths: &[String],
            _ttl: Duration,
        ) -> StorageResult<Vec<(String, StorageResult<SignedUrl>)>> {
            unimplemented!("not used by the upload manager")
        }

        async fn list(
            &self,
            _bucket: &str,
            _folder: &str,
            _options: ListOptions,
        ) -> StorageResult<Vec<StorageEntry>> {
            unimplemented!("not used by the upload manager")
        }

        async fn delete(&self, _bucket: &str, _paths: &[String]) -> StorageResult<()> {
            unimplemented!("not used by the upload manager")
        }
    }

    fn payload() -> UploadPayload {
        UploadPayload::new(
            "paystub.pdf",
            "application/pdf",
            Bytes::from_static(b"%PDF-1.7 paystub"),
        )
    }

    fn destination() -> Destination {
        Destination::new("documents", "app-1/income/paystub.pdf")
    }

    fn config(max_retries: u32, retry_delay: Duration) -> UploadConfig {
        UploadConfig {
            max_retries,
            retry_delay,
            ..UploadConfig::default()
        }
    }

    async fn wait_for_state(manager: &UploadManager, id: &str, state: UploadState) {
        for _ in 0..1000 {
            if manager.get_upload_status(id).map(|s| s.state) == Some(state) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("task {id} never reached {state:?}");
    }

    #[tokio::test]
    async fn successful_upload_reports_progress_then_completes() {
        let storage = StubStorage::new(&[], Step::Succeed);
        let manager = UploadManager::new(storage.clone(), UploadConfig::default());

        let handle = manager
            .start_upload("doc-1", payload(), destination(), None)
            .unwrap();
        let (progress, outcome) = handle.collect().await;

        let result = outcome.unwrap();
        assert_eq!(result.attempts, 1);
        assert_eq!(result.path, "app-1/income/paystub.pdf");
        assert_eq!(progress.first(), Some(&0));
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert!(!manager.is_uploading("doc-1"));
        assert!(manager.get_upload_status("doc-1").is_none());
    }

    #[tokio::test]
    async fn second_start_for_same_id_is_rejected_without_touching_the_first() {
        let storage = StubStorage::new(&[Step::Hang], Step::Succeed);
        let manager = UploadManager::new(storage.clone(), UploadConfig::default());

        let first = manager
            .start_upload("doc-1", payload(), destination(), None)
            .unwrap();
        wait_for_state(&manager, "doc-1", UploadState::Uploading).await;
        let before = manager.get_upload_status("doc-1");

        let second = manager.start_upload("doc-1", payload(), destination(), None);
        assert!(matches!(second, Err(TransferError::AlreadyActive(_))));
        assert_eq!(manager.get_upload_status("doc-1"), before);
        assert_eq!(manager.active_uploads(), vec!["doc-1"]);

        assert!(manager.cancel_upload("doc-1"));
        assert_eq!(first.finish().await, Err(TransferError::Cancelled));
        assert_eq!(storage.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_storage_is_attempted_max_retries_plus_one_times() {
        let storage = StubStorage::new(&[], Step::FailNetwork);
        let manager = UploadManager::new(storage.clone(), config(3, Duration::from_millis(1000)));

        let handle = manager
            .start_upload("doc-1", payload(), destination(), None)
            .unwrap();
        let outcome = handle.finish().await;

        assert!(matches!(outcome, Err(TransferError::TransientNetwork(_))));
        assert_eq!(storage.attempts(), 4);
        assert!(manager.get_upload_status("doc-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_masked_by_retry() {
        let storage = StubStorage::new(&[Step::FailNetwork, Step::FailNetwork], Step::Succeed);
        let manager = UploadManager::new(storage.clone(), UploadConfig::default());

        let started = tokio::time::Instant::now();
        let (progress, outcome) = manager
            .start_upload("doc-1", payload(), destination(), None)
            .unwrap()
            .collect()
            .await;

        assert_eq!(outcome.unwrap().attempts, 3);
        assert_eq!(progress.last(), Some(&100));
        assert!(started.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn permission_errors_are_not_retried() {
        let storage = StubStorage::new(&[], Step::FailPermission);
        let manager = UploadManager::new(storage.clone(), UploadConfig::default());

        let outcome = manager
            .start_upload("doc-1", payload(), destination(), None)
            .unwrap()
            .finish()
            .await;

        assert!(matches!(outcome, Err(TransferError::Permission(_))));
        assert_eq!(storage.attempts(), 1);
    }

    #[tokio::test]
    async fn filesystem_permission_errors_are_not_retried() {
        let storage = StubStorage::new(&[], Step::FailReadOnly);
        let manager = UploadManager::new(storage.clone(), UploadConfig::default());

        let outcome = manager
            .start_upload("doc-1", payload(), destination(), None)
            .unwrap()
            .finish()
            .await;

        assert!(matches!(outcome, Err(TransferError::Permission(_))));
        assert_eq!(storage.attempts(), 1);
        assert!(!manager.is_uploading("doc-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_retryable_failures() {
        let storage = StubStorage::new(&[], Step::Slow(Duration::from_secs(120)));
        let manager = UploadManager::new(storage.clone(), UploadConfig::default());
        let config = UploadConfig {
            max_retries: 1,
            timeout: Duration::from_secs(5),
            ..UploadConfig::default()
        };

        let outcome = manager
            .start_upload("doc-1", payload(), destination(), Some(config))
            .unwrap()
            .finish()
            .await;

        assert_eq!(outcome, Err(TransferError::Timeout(Duration::from_secs(5))));
        assert_eq!(storage.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pausing_during_retry_delay_stops_further_attempts() {
        let storage = StubStorage::new(&[], Step::FailNetwork);
        let manager = UploadManager::new(storage.clone(), config(3, Duration::from_secs(10)));

        let handle = manager
            .start_upload("doc-1", payload(), destination(), None)
            .unwrap();
        wait_for_state(&manager, "doc-1", UploadState::Retrying).await;

        manager.pause_upload("doc-1");
        assert_eq!(handle.finish().await, Err(TransferError::Paused));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(storage.attempts(), 1);
        let status = manager.get_upload_status("doc-1").unwrap();
        assert_eq!(status.state, UploadState::Paused);
        assert!(!manager.is_uploading("doc-1"));
    }

    #[tokio::test]
    async fn pause_aborts_in_flight_attempt_and_resume_restarts_it() {
        let storage = StubStorage::new(&[Step::Hang], Step::Succeed);
        let manager = UploadManager::new(storage.clone(), UploadConfig::default());

        let first = manager
            .start_upload("doc-1", payload(), destination(), None)
            .unwrap();
        wait_for_state(&manager, "doc-1", UploadState::Uploading).await;
        manager.pause_upload("doc-1");
        assert_eq!(first.finish().await, Err(TransferError::Paused));

        let again = manager.start_upload("doc-1", payload(), destination(), None);
        assert!(matches!(again, Err(TransferError::AlreadyActive(_))));

        let (progress, outcome) = manager
            .resume_upload("doc-1", None)
            .unwrap()
            .collect()
            .await;
        assert_eq!(outcome.unwrap().attempts, 1);
        assert_eq!(progress.first(), Some(&0));
        assert_eq!(progress.last(), Some(&100));
        assert_eq!(storage.attempts(), 2);
        assert!(manager.active_uploads().is_empty());
    }

    #[tokio::test]
    async fn resume_requires_a_paused_task() {
        let storage = StubStorage::new(&[Step::Hang], Step::Succeed);
        let manager = UploadManager::new(storage.clone(), UploadConfig::default());

        assert!(matches!(
            manager.resume_upload("nope", None),
            Err(TransferError::UnknownTask(_))
        ));

        let _handle = manager
            .start_upload("doc-1", payload(), destination(), None)
            .unwrap();
        assert!(matches!(
            manager.resume_upload("doc-1", None),
            Err(TransferError::AlreadyActive(_))
        ));
        manager.pause_upload("nope");
    }

    #[tokio::test]
    async fn retired_entries_leave_a_terminal_snapshot() {
        let storage = StubStorage::new(&[], Step::Hang);
        let manager = UploadManager::new(storage, UploadConfig::default());
        let _handle = manager
            .start_upload("doc-1", payload(), destination(), None)
            .unwrap();
        wait_for_state(&manager, "doc-1", UploadState::Uploading).await;
        let run_id = manager.inner.tasks.lock()["doc-1"].run_id;

        assert_eq!(
            manager
                .inner
                .retire_own_entry("doc-1", run_id + 1, UploadState::Failed),
            None
        );
        let last = manager
            .inner
            .retire_own_entry("doc-1", run_id, UploadState::Failed)
            .unwrap();

        assert_eq!(last.state, UploadState::Failed);
        assert!(last.state.is_terminal());
        assert!(!UploadState::Retrying.is_terminal());
        assert_eq!(manager.get_upload_status("doc-1"), None);
    }

    #[tokio::test]
    async fn cleanup_aborts_every_task() {
        let storage = StubStorage::new(&[], Step::Hang);
        let manager = UploadManager::new(storage.clone(), UploadConfig::default());

        let a = manager
            .start_upload("a", payload(), destination(), None)
            .unwrap();
        let b = manager
            .start_upload("b", payload(), destination(), None)
            .unwrap();
        wait_for_state(&manager, "a", UploadState::Uploading).await;
        wait_for_state(&manager, "b", UploadState::Uploading).await;

        manager.cleanup();
        assert!(manager.active_uploads().is_empty());
        assert_eq!(a.finish().await, Err(TransferError::Cancelled));
        assert_eq!(b.finish().await, Err(TransferError::Cancelled));
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(5, 10), 50);
        assert_eq!(percent(20, 10), 100);
    }
}
