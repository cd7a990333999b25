use bytes::Bytes;
use document_sync::{
    models::{
        blob::NewBlob,
        document::{DocumentStatus, NewDocumentRecord},
        storage::UploadOptions,
    },
    services::{
        blob_store::LocalBlobStore,
        metadata_store::SqliteMetadataRepository,
        object_storage::LocalObjectStorage,
        reconciler::{IntegrityReconciler, RemoteInventory},
        remote::{MetadataRepository, ObjectStorage},
    },
};
use std::sync::Arc;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const BUCKET: &str = "documents";

fn remote_path(id: &str) -> String {
    format!("app-1/income/{id}.pdf")
}

async fn reference(metadata: &SqliteMetadataRepository, id: &str) {
    metadata
        .create_document_record(NewDocumentRecord {
            id: id.to_string(),
            application_id: "app-1".into(),
            category: "income".into(),
            filename: format!("{id}.pdf"),
            size_bytes: 3,
            mime_type: "application/pdf".into(),
            remote_path: remote_path(id),
            status: DocumentStatus::Complete,
        })
        .await
        .unwrap();
}

async fn put_remote(storage: &LocalObjectStorage, path: &str) {
    storage
        .upload(
            BUCKET,
            path,
            Bytes::from_static(b"pdf"),
            UploadOptions::default(),
            &|_| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap();
}

async fn put_local(store: &LocalBlobStore, id: &str) {
    store
        .save(
            id,
            NewBlob::new(format!("{id}.pdf"), "application/pdf", Bytes::from_static(b"pdf"))
                .for_application("app-1"),
            Some("income"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn drift_across_local_and_remote_stores_is_detected_and_repaired() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(LocalObjectStorage::new(dir.path(), "http://127.0.0.1:3000", "s"));
    let metadata = Arc::new(SqliteMetadataRepository::in_memory().await.unwrap());
    let store = LocalBlobStore::in_memory().await.unwrap();

    for id in ["a", "b", "c"] {
        reference(&metadata, id).await;
    }
    put_remote(&storage, &remote_path("a")).await;
    put_remote(&storage, &remote_path("c")).await;
    put_remote(&storage, "app-1/income/stray.pdf").await;
    put_local(&store, "a").await;
    put_local(&store, "leftover").await;

    let reconciler = IntegrityReconciler::new(metadata.clone())
        .with_inventory(Arc::new(store.clone()))
        .with_inventory(Arc::new(
            RemoteInventory::new(storage.clone(), BUCKET).with_page_size(1),
        ));

    let report = reconciler.check("app-1").await.unwrap();
    assert_eq!(report.missing_files, vec!["b"]);
    assert_eq!(
        report.orphaned_files,
        vec!["app-1/income/stray.pdf", "leftover"]
    );
    assert!(!report.valid);
    assert!(
        report
            .issues
            .contains(&"\"b.pdf\" (income) is missing from local store and remote storage".to_string())
    );
    assert_eq!(reconciler.check("app-1").await.unwrap(), report);

    let repair = reconciler.repair("app-1", true).await;
    assert!(repair.success, "{repair:?}");
    assert_eq!(repair.repaired_ids, vec!["b"]);
    let cleanup = repair.cleanup.unwrap();
    assert_eq!(cleanup.deleted_count, 2);

    let after = reconciler.check("app-1").await.unwrap();
    assert!(after.valid, "{after:?}");
    assert!(store.get("leftover").await.unwrap().is_none());
    assert!(!dir.path().join("documents/app-1/income/stray.pdf").exists());
    assert_eq!(metadata.list_document_records("app-1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn global_orphans_ignore_application_boundaries() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(LocalObjectStorage::new(dir.path(), "http://127.0.0.1:3000", "s"));
    let metadata = Arc::new(SqliteMetadataRepository::in_memory().await.unwrap());
    reference(&metadata, "x").await;
    put_remote(&storage, &remote_path("x")).await;
    put_remote(&storage, "app-2/y.pdf").await;

    let reconciler = IntegrityReconciler::new(metadata)
        .with_inventory(Arc::new(RemoteInventory::new(storage.clone(), BUCKET)));

    let scan = reconciler.find_orphans().await.unwrap();
    assert_eq!(scan.orphaned_ids, vec!["app-2/y.pdf"]);
    assert_eq!(scan.total_files, 2);
    assert_eq!(scan.referenced_files, 1);

    let preview = reconciler.cleanup_orphans(true).await.unwrap();
    assert_eq!(preview.deleted_count, 1);
    assert!(dir.path().join("documents/app-2/y.pdf").exists());

    reconciler.cleanup_orphans(false).await.unwrap();
    assert!(!dir.path().join("documents/app-2/y.pdf").exists());
    assert!(reconciler.find_orphans().await.unwrap().orphaned_ids.is_empty());
}
