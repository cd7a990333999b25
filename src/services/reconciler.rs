//! src/services/reconciler.rs
//!
//! IntegrityReconciler: audits which documents the metadata says exist
//! against what the blob stores actually hold, and trims metadata (never the
//! reverse) to match.

use crate::{
    models::{
        document::DocumentMetadataRecord,
        report::{CleanupFailure, CleanupReport, ConsistencyReport, OrphanScan, RepairReport},
        storage::ListOptions,
    },
    services::{
        blob_store::{BlobStoreError, LocalBlobStore},
        remote::{MetadataError, MetadataRepository, ObjectStorage, StorageError},
    },
};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use thiserror::Error;
use tracing::{info, warn};

/// Unexpected collaborator failure. Divergence itself is never an error.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("metadata repository failed: {0}")]
    Metadata(#[from] MetadataError),
    #[error("local blob store failed: {0}")]
    BlobStore(#[from] BlobStoreError),
    #[error("object storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("{store} is unavailable: {reason}")]
    Unavailable { store: String, reason: String },
    #[error("no blob store configured for reconciliation")]
    NoInventory,
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Orphan deletions in flight at once.
const CLEANUP_CONCURRENCY: usize = 8;

/// One object a store holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryItem {
    pub key: String,
    pub filename: String,
}

/// A store whose contents the reconciler can enumerate and prune.
#[async_trait]
pub trait BlobInventory: Send + Sync {
    /// Name used in reports, e.g. "local store".
    fn name(&self) -> &str;

    /// Key under which this store keeps `record`'s bytes.
    fn key_for(&self, record: &DocumentMetadataRecord) -> String;

    /// Every object held, or only those belonging to `application_id`.
    async fn list(&self, application_id: Option<&str>) -> ReconcileResult<Vec<InventoryItem>>;

    async fn delete(&self, key: &str) -> ReconcileResult<()>;
}

#[async_trait]
impl BlobInventory for LocalBlobStore {
    fn name(&self) -> &str {
        "local store"
    }

    fn key_for(&self, record: &DocumentMetadataRecord) -> String {
        record.id.clone()
    }

    async fn list(&self, application_id: Option<&str>) -> ReconcileResult<Vec<InventoryItem>> {
        // An unavailable store would look empty and make every document
        // appear missing.
        if !self.is_available() {
            return Err(ReconcileError::Unavailable {
                store: self.name().to_string(),
                reason: self.unavailable_reason().unwrap_or("unknown").to_string(),
            });
        }
        Ok(self
            .index(application_id)
            .await?
            .into_iter()
            .map(|entry| InventoryItem {
                key: entry.id,
                filename: entry.filename,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> ReconcileResult<()> {
        Ok(LocalBlobStore::delete(self, key).await?)
    }
}

/// Remote object storage seen as an inventory: keys are object paths and an
/// application's objects live under the `{application_id}/` folder.
pub struct RemoteInventory {
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
    page_size: usize,
}

impl RemoteInventory {
    pub fn new(storage: Arc<dyn ObjectStorage>, bucket: impl Into<String>) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
            page_size: ListOptions::default().limit,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[async_trait]
impl BlobInventory for RemoteInventory {
    fn name(&self) -> &str {
        "remote storage"
    }

    fn key_for(&self, record: &DocumentMetadataRecord) -> String {
        record.remote_path.clone()
    }

    async fn list(&self, application_id: Option<&str>) -> ReconcileResult<Vec<InventoryItem>> {
        let folder = application_id.unwrap_or("");
        let mut items = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .storage
                .list(
                    &self.bucket,
                    folder,
                    ListOptions {
                        limit: self.page_size,
                        offset,
                    },
                )
                .await?;
            let fetched = page.len();
            items.extend(page.into_iter().map(|entry| InventoryItem {
                filename: entry
                    .path
                    .rsplit('/')
                    .next()
                    .unwrap_or(&entry.path)
                    .to_string(),
                key: entry.path,
            }));
            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }
        Ok(items)
    }

    async fn delete(&self, key: &str) -> ReconcileResult<()> {
        Ok(self.storage.delete(&self.bucket, &[key.to_string()]).await?)
    }
}

pub struct IntegrityReconciler {
    metadata: Arc<dyn MetadataRepository>,
    inventories: Vec<Arc<dyn BlobInventory>>,
}

impl IntegrityReconciler {
    pub fn new(metadata: Arc<dyn MetadataRepository>) -> Self {
        Self {
            metadata,
            inventories: Vec::new(),
        }
    }

    /// Audit `inventory` in addition to the stores already configured.
    pub fn with_inventory(mut self, inventory: Arc<dyn BlobInventory>) -> Self {
        self.inventories.push(inventory);
        self
    }

    /// Compare one application's metadata with the stores.
    ///
    /// A document is missing when no audited store holds it. Orphans are
    /// looked for only among objects scoped to the application.
    pub async fn check(&self, application_id: &str) -> ReconcileResult<ConsistencyReport> {
        if self.inventories.is_empty() {
            return Err(ReconcileError::NoInventory);
        }
        let records = self.metadata.list_document_records(application_id).await?;

        let mut present_anywhere: BTreeSet<String> = BTreeSet::new();
        let mut orphans: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for inventory in &self.inventories {
            let referenced: BTreeSet<String> =
                records.iter().map(|r| inventory.key_for(r)).collect();

            let everything = inventory.list(None).await?;
            let held: BTreeSet<&str> = everything.iter().map(|item| item.key.as_str()).collect();
            for record in &records {
                if held.contains(inventory.key_for(record).as_str()) {
                    present_anywhere.insert(record.id.clone());
                }
            }

            for item in inventory.list(Some(application_id)).await? {
                if !referenced.contains(&item.key) {
                    orphans.entry(item.key.clone()).or_default().push(format!(
                        "\"{}\" in {} has no metadata record",
                        item.filename,
                        inventory.name()
                    ));
                }
            }
        }

        let stores = self
            .inventories
            .iter()
            .map(|inventory| inventory.name())
            .collect::<Vec<_>>()
            .join(" and ");
        let mut missing: Vec<&DocumentMetadataRecord> = records
            .iter()
            .filter(|record| !present_anywhere.contains(&record.id))
            .collect();
        missing.sort_by(|a, b| a.id.cmp(&b.id));

        let mut issues: Vec<String> = missing
            .iter()
            .map(|record| format!("{} is missing from {stores}", record.label()))
            .collect();
        issues.extend(orphans.values().flatten().cloned());

        let report = ConsistencyReport {
            missing_files: missing.iter().map(|record| record.id.clone()).collect(),
            orphaned_files: orphans.into_keys().collect(),
            valid: issues.is_empty(),
            issues,
        };
        info!(
            application_id = %application_id,
            missing = report.missing_files.len(),
            orphaned = report.orphaned_files.len(),
            "consistency check complete"
        );
        Ok(report)
    }

    /// Global scan: an object is orphaned only if no record of any
    /// application references it.
    pub async fn find_orphans(&self) -> ReconcileResult<OrphanScan> {
        if self.inventories.is_empty() {
            return Err(ReconcileError::NoInventory);
        }
        let records = self.metadata.list_all_document_records().await?;

        let mut scan = OrphanScan::default();
        let mut orphaned: BTreeSet<String> = BTreeSet::new();
        for (index, inventory) in self.inventories.iter().enumerate() {
            let referenced: BTreeSet<String> =
                records.iter().map(|r| inventory.key_for(r)).collect();
            for item in inventory.list(None).await? {
                scan.total_files += 1;
                if referenced.contains(&item.key) {
                    scan.referenced_files += 1;
                } else {
                    orphaned.insert(item.key.clone());
                    scan.by_store.push((index, item.key));
                }
            }
        }
        scan.orphaned_ids = orphaned.into_iter().collect();

        info!(
            total = scan.total_files,
            referenced = scan.referenced_files,
            orphaned = scan.orphaned_ids.len(),
            "orphan scan complete"
        );
        Ok(scan)
    }

    /// Delete every orphan found by `find_orphans`, best effort. With
    /// `dry_run` nothing is deleted and `deleted_count` is what would be.
    pub async fn cleanup_orphans(&self, dry_run: bool) -> ReconcileResult<CleanupReport> {
        let scan = self.find_orphans().await?;
        let mut report = CleanupReport {
            dry_run,
            candidates: scan.orphaned_ids.clone(),
            ..CleanupReport::default()
        };

        if dry_run {
            report.deleted_count = scan.by_store.len();
            info!(candidates = report.deleted_count, "orphan cleanup dry run");
            return Ok(report);
        }

        let outcomes: Vec<(String, ReconcileResult<()>)> = stream::iter(scan.by_store)
            .map(|(index, key)| async move {
                let inventory = &self.inventories[index];
                let outcome = inventory.delete(&key).await;
                if let Err(err) = &outcome {
                    warn!(key = %key, store = inventory.name(), error = %err, "could not delete orphan");
                }
                (key, outcome)
            })
            .buffered(CLEANUP_CONCURRENCY)
            .collect()
            .await;

        for (key, outcome) in outcomes {
            match outcome {
                Ok(()) => report.deleted_count += 1,
                Err(err) => report.errors.push(CleanupFailure {
                    id: key,
                    error: err.to_string(),
                }),
            }
        }
        info!(
            deleted = report.deleted_count,
            failed = report.errors.len(),
            "orphan cleanup complete"
        );
        Ok(report)
    }

    /// Drop metadata records whose documents are missing, optionally followed
    /// by a real orphan cleanup. Failures are reported, never raised.
    pub async fn repair(&self, application_id: &str, cleanup_orphans: bool) -> RepairReport {
        let mut report = RepairReport::default();

        match self.check(application_id).await {
            Ok(check) => {
                for id in check.missing_files {
                    match self.metadata.delete_document_record(&id).await {
                        Ok(()) => report.repaired_ids.push(id),
                        Err(err) => {
                            warn!(document_id = %id, error = %err, "could not drop metadata record");
                            report.errors.push(format!("{id}: {err}"));
                        }
                    }
                }
            }
            Err(err) => {
                warn!(application_id = %application_id, error = %err, "repair aborted");
                report.errors.push(err.to_string());
                return report;
            }
        }
        report.repaired_count = report.repaired_ids.len();

        if cleanup_orphans {
            match self.cleanup_orphans(false).await {
                Ok(cleanup) => {
                    report
                        .errors
                        .extend(cleanup.errors.iter().map(|f| format!("{}: {}", f.id, f.error)));
                    report.cleanup = Some(cleanup);
                }
                Err(err) => report.errors.push(err.to_string()),
            }
        }

        report.success = report.errors.is_empty();
        info!(
            application_id = %application_id,
            repaired = report.repaired_count,
            errors = report.errors.len(),
            "repair complete"
        );
        report
    }
}
