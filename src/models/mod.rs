//! Core data models for the document transfer and consistency subsystem.
//!
//! Rows persisted by the embedded SQLite stores map to these types via
//! `sqlx::FromRow`; everything that crosses the CLI or HTTP edge serializes
//! as JSON via `serde`.

pub mod blob;
pub mod document;
pub mod report;
pub mod signed_url;
pub mod storage;
pub mod upload;
