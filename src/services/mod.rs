pub mod blob_store;
pub mod metadata_store;
pub mod object_storage;
pub mod reconciler;
pub mod remote;
pub mod upload_manager;
pub mod url_cache;
