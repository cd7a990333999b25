//! SQLite-backed `MetadataRepository`.
//!
//! Stands in for the remote metadata database in the CLI and in tests. One
//! row per document; a row is the reference the reconciler audits.

use crate::{
    db,
    models::document::{DocumentMetadataRecord, NewDocumentRecord},
    services::remote::{MetadataError, MetadataRepository, MetadataResult},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};

const DOCUMENT_COLUMNS: &str = "id, application_id, category, filename, size_bytes, mime_type, \
     remote_path, status, created_at";

#[derive(Clone, Debug)]
pub struct SqliteMetadataRepository {
    pool: SqlitePool,
}

impl SqliteMetadataRepository {
    pub async fn connect(database_url: &str) -> MetadataResult<Self> {
        let pool = db::connect(database_url)
            .await
            .map_err(|err| MetadataError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> MetadataResult<Self> {
        Ok(Self {
            pool: db::in_memory().await?,
        })
    }

    /// Wrap a pool whose schema has already been applied.
    pub fn from_migrated_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MetadataRepository for SqliteMetadataRepository {
    async fn create_document_record(
        &self,
        input: NewDocumentRecord,
    ) -> MetadataResult<DocumentMetadataRecord> {
        let result = sqlx::query_as::<_, DocumentMetadataRecord>(&format!(
            "INSERT INTO documents ({DOCUMENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(&input.id)
        .bind(&input.application_id)
        .bind(&input.category)
        .bind(&input.filename)
        .bind(input.size_bytes)
        .bind(&input.mime_type)
        .bind(&input.remote_path)
        .bind(input.status)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(record) => Ok(record),
            Err(err) if is_unique_violation(&err) => Err(MetadataError::AlreadyExists(input.id)),
            Err(err) => Err(MetadataError::Sqlx(err)),
        }
    }

    async fn list_document_records(
        &self,
        application_id: &str,
    ) -> MetadataResult<Vec<DocumentMetadataRecord>> {
        Ok(sqlx::query_as::<_, DocumentMetadataRecord>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE application_id = ? ORDER BY id ASC"
        ))
        .bind(application_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_all_document_records(&self) -> MetadataResult<Vec<DocumentMetadataRecord>> {
        Ok(sqlx::query_as::<_, DocumentMetadataRecord>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_document_records(
        &self,
        ids: &[String],
    ) -> MetadataResult<Vec<DocumentMetadataRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY id ASC");

        Ok(builder
            .build_query_as::<DocumentMetadataRecord>()
            .fetch_all(&self.pool)
            .await?)
    }

    async fn delete_document_record(&self, id: &str) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
