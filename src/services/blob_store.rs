//! src/services/blob_store.rs
//!
//! LocalBlobStore: same-device persistence of document bytes keyed by
//! document id, backed by an embedded SQLite database. When the database
//! cannot be opened the store degrades: every operation becomes an empty
//! read or a no-op, and `is_available` reports why.

use crate::{
    db,
    models::blob::{BlobIndexEntry, NewBlob, StoredBlob, UsageInfo},
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob `{id}` is corrupt: recorded size {recorded} but content is {actual} bytes")]
    Corrupt {
        id: String,
        recorded: i64,
        actual: usize,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type BlobStoreResult<T> = Result<T, BlobStoreError>;

const BLOB_COLUMNS: &str =
    "id, filename, size_bytes, mime_type, content, uploaded_at, category, application_id";

#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    pool: Option<SqlitePool>,
    unavailable_reason: Option<String>,
}

impl LocalBlobStore {
    /// Open (or create) the store at `database_url`.
    ///
    /// Never fails: an unreachable database yields a degraded store.
    pub async fn open(database_url: &str) -> Self {
        match db::connect(database_url).await {
            Ok(pool) => Self::from_migrated_pool(pool),
            Err(err) => {
                warn!(
                    database_url = %database_url,
                    error = %err,
                    "Local blob store unavailable, operating in degraded mode"
                );
                Self {
                    pool: None,
                    unavailable_reason: Some(err.to_string()),
                }
            }
        }
    }

    pub async fn in_memory() -> BlobStoreResult<Self> {
        Ok(Self::from_migrated_pool(db::in_memory().await?))
    }

    /// Wrap a pool whose schema has already been applied.
    pub fn from_migrated_pool(pool: SqlitePool) -> Self {
        Self {
            pool: Some(pool),
            unavailable_reason: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.pool.is_some()
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        self.unavailable_reason.as_deref()
    }

    pub fn pool(&self) -> Option<&SqlitePool> {
        self.pool.as_ref()
    }

    /// Store `blob` under `id`, overwriting any previous blob with that id.
    pub async fn save(
        &self,
        id: &str,
        blob: NewBlob,
        category: Option<&str>,
    ) -> BlobStoreResult<()> {
        let Some(pool) = &self.pool else {
            debug!(id = %id, "blob store unavailable, save skipped");
            return Ok(());
        };

        let size_bytes = blob.content.len() as i64;
        sqlx::query(
            r#"
            INSERT INTO blobs (
                id, filename, size_bytes, mime_type, content, uploaded_at, category, application_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                size_bytes = excluded.size_bytes,
                mime_type = excluded.mime_type,
                content = excluded.content,
                uploaded_at = excluded.uploaded_at,
                category = excluded.category,
                application_id = excluded.application_id
            "#,
        )
        .bind(id)
        .bind(&blob.filename)
        .bind(size_bytes)
        .bind(&blob.mime_type)
        .bind(blob.content.as_ref())
        .bind(Utc::now())
        .bind(category)
        .bind(blob.application_id.as_deref())
        .execute(pool)
        .await?;

        debug!(id = %id, size_bytes, "saved blob");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> BlobStoreResult<Option<StoredBlob>> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };

        let blob = sqlx::query_as::<_, StoredBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM blobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        blob.map(ensure_intact).transpose()
    }

    /// Every intact blob, keyed by id. Corrupt rows are skipped.
    pub async fn get_all(&self) -> BlobStoreResult<BTreeMap<String, StoredBlob>> {
        let Some(pool) = &self.pool else {
            return Ok(BTreeMap::new());
        };

        let rows = sqlx::query_as::<_, StoredBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM blobs ORDER BY id ASC"
        ))
        .fetch_all(pool)
        .await?;

        let mut blobs = BTreeMap::new();
        for row in rows {
            match ensure_intact(row) {
                Ok(blob) => {
                    blobs.insert(blob.id.clone(), blob);
                }
                Err(err) => warn!(error = %err, "skipping corrupt blob"),
            }
        }
        Ok(blobs)
    }

    /// Delete `id`. Deleting an unknown id is a no-op.
    pub async fn delete(&self, id: &str) -> BlobStoreResult<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        let result = sqlx::query("DELETE FROM blobs WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            debug!(id = %id, "blob already absent");
        }
        Ok(())
    }

    pub async fn clear(&self) -> BlobStoreResult<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        let result = sqlx::query("DELETE FROM blobs").execute(pool).await?;
        debug!(removed = result.rows_affected(), "cleared blob store");
        Ok(())
    }

    pub async fn usage_info(&self) -> BlobStoreResult<UsageInfo> {
        let Some(pool) = &self.pool else {
            return Ok(UsageInfo::default());
        };

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT id, size_bytes FROM blobs ORDER BY id ASC")
                .fetch_all(pool)
                .await?;

        let mut usage = UsageInfo::default();
        for (id, size) in rows {
            let size = size.max(0) as u64;
            usage.total_bytes += size;
            usage.count += 1;
            usage.per_file_sizes.insert(id, size);
        }
        Ok(usage)
    }

    /// Every blob's id and filename without loading content, optionally
    /// only those saved for `application_id`.
    pub async fn index(&self, application_id: Option<&str>) -> BlobStoreResult<Vec<BlobIndexEntry>> {
        let Some(pool) = &self.pool else {
            return Ok(Vec::new());
        };

        let entries = match application_id {
            Some(application_id) => {
                sqlx::query_as::<_, BlobIndexEntry>(
                    "SELECT id, filename, size_bytes, application_id FROM blobs \
                     WHERE application_id = ? ORDER BY id ASC",
                )
                .bind(application_id)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, BlobIndexEntry>(
                    "SELECT id, filename, size_bytes, application_id FROM blobs ORDER BY id ASC",
                )
                .fetch_all(pool)
                .await?
            }
        };
        Ok(entries)
    }
}

fn ensure_intact(blob: StoredBlob) -> BlobStoreResult<StoredBlob> {
    if blob.size_bytes != blob.content.len() as i64 {
        return Err(BlobStoreError::Corrupt {
            recorded: blob.size_bytes,
            actual: blob.content.len(),
            id: blob.id,
        });
    }
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn lease_pdf(body: &'static [u8]) -> NewBlob {
        NewBlob::new("lease.pdf", "application/pdf", Bytes::from_static(body))
    }

    #[tokio::test]
    async fn save_then_get_round_trips_content() {
        let store = LocalBlobStore::in_memory().await.unwrap();
        store
            .save("doc-1", lease_pdf(b"%PDF-1.7"), Some("income"))
            .await
            .unwrap();

        let blob = store.get("doc-1").await.unwrap().unwrap();
        assert_eq!(blob.content, b"%PDF-1.7");
        assert_eq!(blob.size_bytes, 8);
        assert_eq!(blob.filename, "lease.pdf");
        assert_eq!(blob.category.as_deref(), Some("income"));
        assert!(store.get("doc-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_existing_id() {
        let store = LocalBlobStore::in_memory().await.unwrap();
        store.save("doc-1", lease_pdf(b"v1"), None).await.unwrap();
        store
            .save("doc-1", lease_pdf(b"version two"), None)
            .await
            .unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["doc-1"].content, b"version two");
    }

    #[tokio::test]
    async fn delete_unknown_id_is_noop() {
        let store = LocalBlobStore::in_memory().await.unwrap();
        store.save("doc-1", lease_pdf(b"x"), None).await.unwrap();

        store.delete("missing").await.unwrap();
        store.delete("doc-1").await.unwrap();
        store.delete("doc-1").await.unwrap();
        assert!(store.index(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn usage_info_sums_sizes() {
        let store = LocalBlobStore::in_memory().await.unwrap();
        store.save("a", lease_pdf(b"1234"), None).await.unwrap();
        store.save("b", lease_pdf(b"123456"), None).await.unwrap();

        let usage = store.usage_info().await.unwrap();
        assert_eq!(usage.count, 2);
        assert_eq!(usage.total_bytes, 10);
        assert_eq!(usage.per_file_sizes.get("b"), Some(&6));

        store.clear().await.unwrap();
        assert_eq!(store.usage_info().await.unwrap(), UsageInfo::default());
    }

    #[tokio::test]
    async fn index_can_be_scoped_to_an_application() {
        let store = LocalBlobStore::in_memory().await.unwrap();
        store
            .save("a", lease_pdf(b"1").for_application("app-1"), None)
            .await
            .unwrap();
        store
            .save("b", lease_pdf(b"2").for_application("app-2"), None)
            .await
            .unwrap();
        store.save("c", lease_pdf(b"3"), None).await.unwrap();

        let ids = |entries: Vec<BlobIndexEntry>| {
            entries.into_iter().map(|e| e.id).collect::<Vec<_>>()
        };
        assert_eq!(ids(store.index(Some("app-1")).await.unwrap()), vec!["a"]);
        assert_eq!(ids(store.index(None).await.unwrap()), vec!["a", "b", "c"]);

        let scoped = store.index(Some("app-2")).await.unwrap();
        assert_eq!(scoped[0].filename, "lease.pdf");
        assert_eq!(scoped[0].application_id.as_deref(), Some("app-2"));
    }

    #[tokio::test]
    async fn corrupt_rows_are_reported_and_skipped() {
        let store = LocalBlobStore::in_memory().await.unwrap();
        store.save("good", lease_pdf(b"ok"), None).await.unwrap();
        store.save("bad", lease_pdf(b"abc"), None).await.unwrap();
        sqlx::query("UPDATE blobs SET size_bytes = 99 WHERE id = 'bad'")
            .execute(store.pool().unwrap())
            .await
            .unwrap();

        assert!(matches!(
            store.get("bad").await,
            Err(BlobStoreError::Corrupt { recorded: 99, .. })
        ));
        let all = store.get_all().await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["good"]);
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_empty_results() {
        let store = LocalBlobStore::open("sqlite:///dev/null/blobs.db").await;
        assert!(!store.is_available());
        assert!(store.unavailable_reason().is_some());

        store.save("doc-1", lease_pdf(b"x"), None).await.unwrap();
        assert!(store.get("doc-1").await.unwrap().is_none());
        assert!(store.get_all().await.unwrap().is_empty());
        store.delete("doc-1").await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.usage_info().await.unwrap().count, 0);
    }
}
