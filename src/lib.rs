//! Client-side document transfer and consistency.
//!
//! - [`services::upload_manager`] drives uploads with retry, pause, resume and cancel.
//! - [`services::url_cache`] hands out signed URLs and refreshes them ahead of expiry.
//! - [`services::blob_store`] keeps document bytes on this device.
//! - [`services::reconciler`] audits metadata against the blob stores and repairs drift.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
