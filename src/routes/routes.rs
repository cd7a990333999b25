//! Defines the HTTP routes of the local storage backend.
//!
//! ## Structure
//! - `GET /healthz` liveness
//! - `GET /readyz` readiness (blob database + disk)
//! - `GET /objects/{bucket}/{*path}?expires=&signature=` signed download
//!
//! The wildcard `*path` allows nested paths like `app-1/income/w2.pdf`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::get_signed_object,
    },
    state::AppState,
};
use axum::{Router, routing::get};

/// Build and return the router, carrying `AppState` to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/objects/{bucket}/{*path}", get(get_signed_object))
}
