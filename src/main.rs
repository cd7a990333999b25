use anyhow::{Context, Result, bail};
use axum::Router;
use bytes::Bytes;
use document_sync::{
    config::{AppConfig, Command},
    db,
    models::{
        blob::NewBlob,
        document::{DocumentStatus, NewDocumentRecord},
        upload::{Destination, UploadPayload, UploadPolicy, mime_type_for},
    },
    routes,
    services::{
        blob_store::LocalBlobStore,
        metadata_store::SqliteMetadataRepository,
        object_storage::LocalObjectStorage,
        reconciler::{IntegrityReconciler, RemoteInventory},
        remote::MetadataRepository,
        upload_manager::UploadManager,
        url_cache::{MetadataUrlIssuer, SignedUrlCache},
    },
    state::AppState,
};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::info!(command = ?command, host = %cfg.host, port = cfg.port, storage_dir = %cfg.storage_dir, database_url = %cfg.database_url, "Starting document-sync");

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    match command {
        Command::Serve => serve(&cfg).await,
        Command::Migrate => {
            db::connect(&cfg.database_url)
                .await
                .with_context(|| format!("migrating {}", cfg.database_url))?;
            tracing::info!("Database migration complete.");
            Ok(())
        }
        Command::Upload {
            application,
            category,
            id,
            file,
        } => {
            let pool = open_pool(&cfg).await?;
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let filename = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .with_context(|| format!("{} has no file name", file.display()))?;
            let content = Bytes::from(
                tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("reading {}", file.display()))?,
            );
            let payload = UploadPayload::new(filename.clone(), mime_type_for(&filename), content);
            UploadPolicy::default()
                .validate(&payload)
                .map_err(|err| anyhow::anyhow!(err.user_message()))?;

            let storage = Arc::new(object_storage(&cfg));
            let manager = UploadManager::new(storage, cfg.upload_config());
            let remote_path = format!("{application}/{category}/{id}-{filename}");
            let mut handle = manager.start_upload(
                &id,
                payload.clone(),
                Destination::new(&cfg.bucket, &remote_path),
                None,
            )?;
            while let Some(progress) = handle.next_progress().await {
                tracing::info!(document_id = %id, progress, "uploading");
            }
            let uploaded = handle
                .finish()
                .await
                .map_err(|err| anyhow::anyhow!(err.user_message()))?;

            let metadata = SqliteMetadataRepository::from_migrated_pool(pool.clone());
            let record = metadata
                .create_document_record(NewDocumentRecord {
                    id: id.clone(),
                    application_id: application.clone(),
                    category: category.clone(),
                    filename: filename.clone(),
                    size_bytes: payload.size() as i64,
                    mime_type: payload.mime_type.clone(),
                    remote_path: uploaded.path.clone(),
                    status: DocumentStatus::Complete,
                })
                .await?;
            LocalBlobStore::from_migrated_pool(pool)
                .save(
                    &id,
                    NewBlob::new(filename, payload.mime_type, payload.content)
                        .for_application(application),
                    Some(&category),
                )
                .await?;
            print_json(&record)
        }
        Command::Urls { ids } => {
            let pool = open_pool(&cfg).await?;
            let issuer = MetadataUrlIssuer::new(
                Arc::new(SqliteMetadataRepository::from_migrated_pool(pool)),
                Arc::new(object_storage(&cfg)),
                &cfg.bucket,
            );
            let mut url_config = cfg.url_cache_config();
            url_config.auto_refresh = false;
            let cache = SignedUrlCache::new(Arc::new(issuer), url_config);
            let urls = cache.resolve(ids.iter().cloned()).await;
            for id in ids.iter().filter(|id| !urls.contains_key(*id)) {
                tracing::warn!(document_id = %id, "no signed url issued");
            }
            print_json(&urls)
        }
        Command::Check { application } => {
            let reconciler = reconciler(&cfg).await?;
            print_json(&reconciler.check(&application).await?)
        }
        Command::Orphans => {
            let reconciler = reconciler(&cfg).await?;
            print_json(&reconciler.find_orphans().await?)
        }
        Command::Cleanup { apply } => {
            let reconciler = reconciler(&cfg).await?;
            print_json(&reconciler.cleanup_orphans(!apply).await?)
        }
        Command::Repair {
            application,
            cleanup_orphans,
        } => {
            let reconciler = reconciler(&cfg).await?;
            let report = reconciler.repair(&application, cleanup_orphans).await;
            print_json(&report)?;
            if !report.success {
                bail!("repair finished with {} error(s)", report.errors.len());
            }
            Ok(())
        }
        Command::Usage => {
            let store = LocalBlobStore::open(&cfg.database_url).await;
            if let Some(reason) = store.unavailable_reason() {
                bail!("local blob store unavailable: {reason}");
            }
            print_json(&store.usage_info().await?)
        }
    }
}

async fn serve(cfg: &AppConfig) -> Result<()> {
    // --- Initialize shared state ---
    let state = AppState {
        storage: Arc::new(object_storage(cfg)),
        blob_store: LocalBlobStore::open(&cfg.database_url).await,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn open_pool(cfg: &AppConfig) -> Result<SqlitePool> {
    db::connect(&cfg.database_url)
        .await
        .with_context(|| format!("opening {}", cfg.database_url))
}

fn object_storage(cfg: &AppConfig) -> LocalObjectStorage {
    LocalObjectStorage::new(
        &cfg.storage_dir,
        &cfg.public_url,
        cfg.signing_secret.as_bytes(),
    )
}

/// Reconciler over the local blob store and the object storage bucket.
async fn reconciler(cfg: &AppConfig) -> Result<IntegrityReconciler> {
    let pool = open_pool(cfg).await?;
    Ok(
        IntegrityReconciler::new(Arc::new(SqliteMetadataRepository::from_migrated_pool(
            pool.clone(),
        )))
        .with_inventory(Arc::new(LocalBlobStore::from_migrated_pool(pool)))
        .with_inventory(Arc::new(RemoteInventory::new(
            Arc::new(object_storage(cfg)),
            &cfg.bucket,
        ))),
    )
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
