//! Binary objects held in the Local Blob Store.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use std::collections::BTreeMap;

/// A blob persisted in the Local Blob Store.
///
/// `size_bytes` always equals `content.len()`; rows violating this are
/// treated as corrupt by the store.
#[derive(Clone, FromRow, Debug, PartialEq)]
pub struct StoredBlob {
    pub id: String,
    pub filename: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub content: Vec<u8>,
    pub uploaded_at: DateTime<Utc>,
    pub category: Option<String>,

    /// Owning application, when known. Scopes per-application orphan checks.
    pub application_id: Option<String>,
}

/// A blob's identity without its content.
#[derive(Serialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct BlobIndexEntry {
    pub id: String,
    pub filename: String,
    pub size_bytes: i64,
    pub application_id: Option<String>,
}

/// Content handed to `LocalBlobStore::save`.
#[derive(Clone, Debug)]
pub struct NewBlob {
    pub filename: String,
    pub mime_type: String,
    pub content: Bytes,
    pub application_id: Option<String>,
}

impl NewBlob {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, content: Bytes) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            content,
            application_id: None,
        }
    }

    pub fn for_application(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = Some(application_id.into());
        self
    }
}

/// Storage usage of the Local Blob Store.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct UsageInfo {
    pub total_bytes: u64,
    pub count: usize,
    pub per_file_sizes: BTreeMap<String, u64>,
}
