//! Collaborator contracts consumed by the transfer core.
//!
//! The remote object storage and the remote metadata database are black
//! boxes; these traits are all the core knows about them. `LocalObjectStorage`
//! and `SqliteMetadataRepository` are the in-tree implementations.

use crate::models::{
    document::{DocumentMetadataRecord, NewDocumentRecord},
    signed_url::SignedUrl,
    storage::{ListOptions, StorageEntry, UploadOptions, UploadedObject},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{io, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{path}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, path: String },
    #[error("object `{path}` already exists in bucket `{bucket}`")]
    AlreadyExists { bucket: String, path: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("invalid object path `{0}`")]
    InvalidPath(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("could not sign url: {0}")]
    Signing(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Receives the number of bytes transferred so far.
pub type ProgressFn<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// Remote object storage: upload, sign, list, delete.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload `bytes` to `bucket/path`.
    ///
    /// Implementations report progress through `progress` when they can and
    /// must stop promptly with `StorageError::Cancelled` once `cancel` fires.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        options: UploadOptions,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> StorageResult<UploadedObject>;

    /// Issue a time-limited read URL for one object.
    async fn issue_signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> StorageResult<SignedUrl>;

    /// Issue URLs for many objects in one request.
    ///
    /// The outer error means the whole request failed; inner errors are
    /// per-path failures.
    async fn issue_signed_urls(
        &self,
        bucket: &str,
        paths: &[String],
        ttl: Duration,
    ) -> StorageResult<Vec<(String, StorageResult<SignedUrl>)>>;

    /// List objects below `folder` (recursively), ordered by path.
    async fn list(
        &self,
        bucket: &str,
        folder: &str,
        options: ListOptions,
    ) -> StorageResult<Vec<StorageEntry>>;

    /// Delete the given paths. Paths that do not exist are ignored.
    async fn delete(&self, bucket: &str, paths: &[String]) -> StorageResult<()>;
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("document record `{0}` not found")]
    NotFound(String),
    #[error("document record `{0}` already exists")]
    AlreadyExists(String),
    #[error("metadata database unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Remote metadata database holding the record of truth for documents.
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    async fn create_document_record(
        &self,
        input: NewDocumentRecord,
    ) -> MetadataResult<DocumentMetadataRecord>;

    async fn list_document_records(
        &self,
        application_id: &str,
    ) -> MetadataResult<Vec<DocumentMetadataRecord>>;

    /// Every record across every application.
    async fn list_all_document_records(&self) -> MetadataResult<Vec<DocumentMetadataRecord>>;

    /// Records for the given ids; unknown ids are skipped.
    async fn get_document_records(
        &self,
        ids: &[String],
    ) -> MetadataResult<Vec<DocumentMetadataRecord>>;

    async fn delete_document_record(&self, id: &str) -> MetadataResult<()>;
}
