//! HTTP handler serving objects behind signed URLs.
//! Streams object bodies to avoid buffering in memory and delegates signature
//! checks to `LocalObjectStorage`.

use crate::{errors::AppError, models::upload::mime_type_for, state::AppState};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Query string carried by every signed URL.
#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
}

/// Download `/objects/{bucket}/{*path}` as a streaming response.
///
/// 403 when the signature is wrong or expired, 404 when the object is gone.
pub async fn get_signed_object(
    State(state): State<AppState>,
    Path((bucket, path)): Path<(String, String)>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, AppError> {
    state
        .storage
        .verify_signed_request(&bucket, &path, query.expires, &query.signature)?;

    let (file, size) = state.storage.open_object(&bucket, &path).await?;
    debug!(bucket = %bucket, path = %path, size, "serving signed object");

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &path, size);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, path: &str, size: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(mime_type_for(path)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, no-store"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::storage::UploadOptions,
        services::{
            blob_store::LocalBlobStore, object_storage::LocalObjectStorage, remote::ObjectStorage,
        },
    };
    use bytes::Bytes;
    use std::{sync::Arc, time::Duration};
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    async fn state(root: &std::path::Path) -> AppState {
        let storage = LocalObjectStorage::new(root, "http://files.test", "secret");
        storage
            .upload(
                "documents",
                "app-1/income/w2.pdf",
                Bytes::from_static(b"%PDF w2"),
                UploadOptions::default(),
                &|_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        AppState {
            storage: Arc::new(storage),
            blob_store: LocalBlobStore::in_memory().await.unwrap(),
        }
    }

    fn query_of(url: &str) -> SignedQuery {
        let query = url.split_once('?').unwrap().1;
        let mut expires = 0;
        let mut signature = String::new();
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("expires", v) => expires = v.parse().unwrap(),
                ("signature", v) => signature = v.to_string(),
                _ => {}
            }
        }
        SignedQuery { expires, signature }
    }

    #[tokio::test]
    async fn signed_url_downloads_the_object() {
        let dir = tempdir().unwrap();
        let state = state(dir.path()).await;
        let signed = state
            .storage
            .issue_signed_url("documents", "app-1/income/w2.pdf", Duration::from_secs(60))
            .await
            .unwrap();

        let response = get_signed_object(
            State(state),
            Path(("documents".into(), "app-1/income/w2.pdf".into())),
            Query(query_of(&signed.url)),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "7");
    }

    #[tokio::test]
    async fn tampered_signature_is_forbidden() {
        let dir = tempdir().unwrap();
        let state = state(dir.path()).await;
        let signed = state
            .storage
            .issue_signed_url("documents", "app-1/income/w2.pdf", Duration::from_secs(60))
            .await
            .unwrap();

        let err = get_signed_object(
            State(state),
            Path(("documents".into(), "app-1/income/other.pdf".into())),
            Query(query_of(&signed.url)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }
}
