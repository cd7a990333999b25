//! Value types exchanged with the object storage collaborator.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Options for a single object upload.
#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    /// Overwrite an existing object at the same path.
    pub upsert: bool,
    pub content_type: Option<String>,
}

/// What the object storage reports after a successful upload.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadedObject {
    pub path: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// Pagination for `ObjectStorage::list`.
#[derive(Clone, Copy, Debug)]
pub struct ListOptions {
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// One entry returned by `ObjectStorage::list`.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct StorageEntry {
    /// Full path of the object inside its bucket.
    pub path: String,
    pub size: u64,
    pub updated_at: Option<DateTime<Utc>>,
}
