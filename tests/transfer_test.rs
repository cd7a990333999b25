use bytes::Bytes;
use document_sync::{
    errors::TransferError,
    models::{
        document::{DocumentStatus, NewDocumentRecord},
        upload::{Destination, UploadConfig, UploadPayload, UploadPolicy},
    },
    services::{
        metadata_store::SqliteMetadataRepository,
        object_storage::LocalObjectStorage,
        remote::MetadataRepository,
        upload_manager::UploadManager,
        url_cache::{MetadataUrlIssuer, SignedUrlCache, UrlCacheConfig},
    },
};
use std::{sync::Arc, time::Duration};
use tempfile::tempdir;

const BUCKET: &str = "documents";

fn storage(root: &std::path::Path) -> Arc<LocalObjectStorage> {
    Arc::new(LocalObjectStorage::new(
        root,
        "http://127.0.0.1:3000",
        "integration-secret",
    ))
}

async fn upload_and_record(
    manager: &UploadManager,
    metadata: &SqliteMetadataRepository,
    id: &str,
    body: Vec<u8>,
) -> Vec<u8> {
    let filename = format!("{id}.pdf");
    let payload = UploadPayload::new(&filename, "application/pdf", Bytes::from(body));
    UploadPolicy::default().validate(&payload).unwrap();
    let size = payload.size() as i64;

    let (progress, outcome) = manager
        .start_upload(
            id,
            payload,
            Destination::new(BUCKET, format!("app-1/income/{filename}")),
            None,
        )
        .unwrap()
        .collect()
        .await;
    let uploaded = outcome.unwrap();

    metadata
        .create_document_record(NewDocumentRecord {
            id: id.to_string(),
            application_id: "app-1".into(),
            category: "income".into(),
            filename,
            size_bytes: size,
            mime_type: "application/pdf".into(),
            remote_path: uploaded.path,
            status: DocumentStatus::Complete,
        })
        .await
        .unwrap();
    progress
}

#[tokio::test]
async fn uploaded_documents_resolve_to_verifiable_signed_urls() {
    let dir = tempdir().unwrap();
    let storage = storage(dir.path());
    let metadata = Arc::new(SqliteMetadataRepository::in_memory().await.unwrap());
    let manager = UploadManager::new(storage.clone(), UploadConfig::default());

    let progress = upload_and_record(&manager, &metadata, "w2", vec![1u8; 200 * 1024]).await;
    assert_eq!(progress.first(), Some(&0));
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.len() > 2, "chunked upload reports intermediate progress");
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    upload_and_record(&manager, &metadata, "paystub", b"%PDF paystub".to_vec()).await;
    assert!(manager.active_uploads().is_empty());

    let cache = SignedUrlCache::new(
        Arc::new(MetadataUrlIssuer::new(metadata.clone(), storage.clone(), BUCKET)),
        UrlCacheConfig {
            auto_refresh: false,
            refresh_buffer: Duration::from_secs(60),
            ..UrlCacheConfig::default()
        },
    );
    let urls = cache.resolve(["w2", "paystub", "unknown"]).await;
    assert_eq!(urls.len(), 2);
    assert!(!urls.contains_key("unknown"));
    assert!(cache.is_expired("unknown", Duration::ZERO));
    assert!(!cache.is_expired("w2", Duration::from_secs(60)));

    let url = &urls["w2"].url;
    assert!(url.starts_with("http://127.0.0.1:3000/objects/documents/app-1/income/w2.pdf?"));
    let query = url.split_once('?').unwrap().1;
    let (expires, signature) = query.split_once('&').unwrap();
    let expires: i64 = expires.trim_start_matches("expires=").parse().unwrap();
    let signature = signature.trim_start_matches("signature=");
    storage
        .verify_signed_request(BUCKET, "app-1/income/w2.pdf", expires, signature)
        .unwrap();
}

#[tokio::test]
async fn rejected_payloads_never_become_tasks() {
    let dir = tempdir().unwrap();
    let manager = UploadManager::new(storage(dir.path()), UploadConfig::default());
    let policy = UploadPolicy::default();

    let payload = UploadPayload::new("notes.txt", "text/plain", Bytes::from_static(b"hi"));
    let err = policy.validate(&payload).unwrap_err();
    assert!(matches!(err, TransferError::Validation(_)));
    assert!(!err.is_retryable());
    assert!(manager.active_uploads().is_empty());
}

#[tokio::test]
async fn storage_refusals_surface_without_retry() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(
        LocalObjectStorage::new(dir.path(), "http://127.0.0.1:3000", "secret")
            .with_max_object_bytes(4),
    );
    let manager = UploadManager::new(storage, UploadConfig::default());

    let outcome = manager
        .start_upload(
            "big",
            UploadPayload::new("big.pdf", "application/pdf", Bytes::from_static(b"too large")),
            Destination::new(BUCKET, "app-1/big.pdf"),
            None,
        )
        .unwrap()
        .finish()
        .await;

    let err = outcome.unwrap_err();
    assert!(matches!(err, TransferError::Validation(_)));
    assert!(!manager.is_uploading("big"));
}
