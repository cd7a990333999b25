//! Upload task state, per-call configuration and caller-boundary policy.

use crate::errors::TransferError;
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;

/// Binary content of a document plus what the storage needs to know about it.
#[derive(Clone, Debug)]
pub struct UploadPayload {
    pub filename: String,
    pub mime_type: String,
    pub content: Bytes,
}

impl UploadPayload {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, content: Bytes) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            content,
        }
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Where an upload lands: a bucket and a path inside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub bucket: String,
    pub path: String,
}

impl Destination {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Pending,
    Uploading,
    Paused,
    Retrying,
    Complete,
    Failed,
    Cancelled,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot returned by `UploadManager::get_upload_status`.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadStatus {
    pub state: UploadState,
    pub retry_count: u32,
    /// Last reported progress, 0..=100.
    pub progress: u8,
}

/// Successful outcome of an upload task.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadResult {
    pub document_id: String,
    pub bucket: String,
    pub path: String,
    pub size: u64,
    pub etag: Option<String>,
    /// Total attempts made, including the successful one.
    pub attempts: u32,
}

/// Delay policy between retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RetryBackoff {
    #[default]
    Fixed,
    /// `retry_delay * 2^(retry_count - 1)`, capped at `MAX_BACKOFF`.
    Exponential,
}

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Per-call upload configuration.
#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff: RetryBackoff,
    /// Per-attempt timeout; elapsing counts as a retryable failure.
    pub timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            backoff: RetryBackoff::Fixed,
            timeout: Duration::from_secs(30),
        }
    }
}

impl UploadConfig {
    /// Delay before retry number `retry_count` (1-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        match self.backoff {
            RetryBackoff::Fixed => self.retry_delay,
            RetryBackoff::Exponential => {
                let factor = 2u32.saturating_pow(retry_count.saturating_sub(1));
                self.retry_delay.saturating_mul(factor).min(MAX_BACKOFF)
            }
        }
    }
}

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_ALLOWED_MIME_TYPES: [&str; 3] = ["application/pdf", "image/jpeg", "image/png"];

/// Size and type limits checked by callers before a task is created.
///
/// The upload manager never consults this; rejected payloads never become tasks.
#[derive(Clone, Debug)]
pub struct UploadPolicy {
    pub max_size_bytes: u64,
    pub allowed_mime_types: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_mime_types: DEFAULT_ALLOWED_MIME_TYPES
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

impl UploadPolicy {
    pub fn validate(&self, payload: &UploadPayload) -> Result<(), TransferError> {
        if payload.content.is_empty() {
            return Err(TransferError::Validation(format!(
                "{} is empty",
                payload.filename
            )));
        }
        if payload.size() > self.max_size_bytes {
            return Err(TransferError::Validation(format!(
                "{} is {} bytes; the limit is {} bytes",
                payload.filename,
                payload.size(),
                self.max_size_bytes
            )));
        }
        if !self
            .allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&payload.mime_type))
        {
            return Err(TransferError::Validation(format!(
                "{} has unsupported type {}",
                payload.filename, payload.mime_type
            )));
        }
        Ok(())
    }
}

/// Content type inferred from a filename's extension.
pub fn mime_type_for(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("pdf") => "application/pdf",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}
