//! Durable record of "a document belongs to this application".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Processing status of a document as tracked by the metadata database.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploading,
    Processing,
    Complete,
    Error,
}

/// A metadata record referencing a blob by id.
///
/// The remote database owns this record; the Local Blob Store and the remote
/// object storage independently own the bytes it points at.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct DocumentMetadataRecord {
    /// Document id. Matches the StoredBlob / upload task id when staged locally.
    pub id: String,

    /// Application this document belongs to.
    pub application_id: String,

    /// Document category (e.g. "income", "identity").
    pub category: String,

    /// Original filename, used when reporting issues to users.
    pub filename: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MIME type of the content.
    pub mime_type: String,

    /// Path of the object inside the remote bucket.
    pub remote_path: String,

    pub status: DocumentStatus,

    pub created_at: DateTime<Utc>,
}

/// Input for `MetadataRepository::create_document_record`.
#[derive(Deserialize, Clone, Debug)]
pub struct NewDocumentRecord {
    pub id: String,
    pub application_id: String,
    pub category: String,
    pub filename: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub remote_path: String,
    pub status: DocumentStatus,
}

impl DocumentMetadataRecord {
    /// Short human label used in reconciliation issues.
    pub fn label(&self) -> String {
        format!("\"{}\" ({})", self.filename, self.category)
    }
}
