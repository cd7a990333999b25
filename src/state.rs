//! Shared state handed to every HTTP handler.

use crate::services::{blob_store::LocalBlobStore, object_storage::LocalObjectStorage};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<LocalObjectStorage>,
    pub blob_store: LocalBlobStore,
}
