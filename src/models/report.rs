//! Outputs of the Integrity Reconciler.

use serde::Serialize;

/// Result of auditing one application's metadata against the blob stores.
///
/// Divergence is data, not an error: `valid` is false whenever either list
/// is non-empty.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Document ids referenced by metadata but absent from a store.
    pub missing_files: Vec<String>,
    /// Blob keys present in a store but referenced by no metadata record.
    pub orphaned_files: Vec<String>,
    /// Human-readable descriptions naming the affected files.
    pub issues: Vec<String>,
    pub valid: bool,
}

/// Result of the global orphan scan.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct OrphanScan {
    pub orphaned_ids: Vec<String>,
    pub total_files: usize,
    pub referenced_files: usize,
    /// Orphans grouped per store, as `(store, key)` pairs.
    #[serde(skip)]
    pub(crate) by_store: Vec<(usize, String)>,
}

/// A single failed deletion during orphan cleanup.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CleanupFailure {
    pub id: String,
    pub error: String,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub candidates: Vec<String>,
    pub deleted_count: usize,
    pub errors: Vec<CleanupFailure>,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub success: bool,
    pub repaired_count: usize,
    pub repaired_ids: Vec<String>,
    pub errors: Vec<String>,
    pub cleanup: Option<CleanupReport>,
}
