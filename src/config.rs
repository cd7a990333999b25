use crate::{
    models::upload::{RetryBackoff, UploadConfig},
    services::url_cache::UrlCacheConfig,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{
    env,
    error::Error as StdError,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

const SIGNING_SECRET_FILE: &str = ".signing_secret";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub public_url: String,
    pub signing_secret: String,
    pub bucket: String,

    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub exponential_backoff: bool,
    pub request_timeout_ms: u64,
    pub refresh_buffer_ms: u64,
    pub auto_refresh: bool,
    pub url_ttl_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Document transfer, signed URLs and integrity checks")]
pub struct Args {
    /// Host to bind to (overrides DOCUMENT_SYNC_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DOCUMENT_SYNC_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides DOCUMENT_SYNC_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DOCUMENT_SYNC_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Externally reachable base URL used in signed URLs (overrides DOCUMENT_SYNC_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Bucket documents are uploaded to (overrides DOCUMENT_SYNC_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Retries per upload after the first attempt (overrides DOCUMENT_SYNC_MAX_RETRIES)
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Delay between upload retries (overrides DOCUMENT_SYNC_RETRY_DELAY_MS)
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve signed object downloads and health probes (default)
    Serve,
    /// Upload a file, record its metadata and stage it locally
    Upload {
        #[arg(long)]
        application: String,
        #[arg(long)]
        category: String,
        /// Document id; a random one is generated when omitted
        #[arg(long)]
        id: Option<String>,
        file: PathBuf,
    },
    /// Print signed URLs for the given documents
    Urls {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Compare one application's metadata with the blob stores
    Check {
        #[arg(long)]
        application: String,
    },
    /// List blobs referenced by no metadata record
    Orphans,
    /// Delete orphaned blobs (dry run unless --apply)
    Cleanup {
        #[arg(long)]
        apply: bool,
    },
    /// Drop metadata records whose files are missing
    Repair {
        #[arg(long)]
        application: String,
        #[arg(long)]
        cleanup_orphans: bool,
    },
    /// Local blob store usage
    Usage,
    /// Run migrations and exit
    Migrate,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, Command)> {
        // --- Environment fallback ---
        let env_host = env::var("DOCUMENT_SYNC_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("DOCUMENT_SYNC_PORT", 3000)?;
        let env_storage =
            env::var("DOCUMENT_SYNC_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("DOCUMENT_SYNC_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/document_sync.db".into());
        let env_bucket = env::var("DOCUMENT_SYNC_BUCKET").unwrap_or_else(|_| "documents".into());
        let env_max_retries = env_parse("DOCUMENT_SYNC_MAX_RETRIES", 3)?;
        let env_retry_delay = env_parse("DOCUMENT_SYNC_RETRY_DELAY_MS", 1000)?;

        let port = args.port.unwrap_or(env_port);
        let env_public_url = env::var("DOCUMENT_SYNC_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://127.0.0.1:{port}"));
        let storage_dir = args.storage_dir.unwrap_or(env_storage);
        let signing_secret = match env::var("DOCUMENT_SYNC_SIGNING_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => load_or_create_signing_secret(Path::new(&storage_dir))?,
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            storage_dir,
            database_url: args.database_url.unwrap_or(env_db),
            public_url: args.public_url.unwrap_or(env_public_url),
            signing_secret,
            bucket: args.bucket.unwrap_or(env_bucket),
            max_retries: args.max_retries.unwrap_or(env_max_retries),
            retry_delay_ms: args.retry_delay_ms.unwrap_or(env_retry_delay),
            exponential_backoff: env_parse("DOCUMENT_SYNC_EXPONENTIAL_BACKOFF", false)?,
            request_timeout_ms: env_parse("DOCUMENT_SYNC_REQUEST_TIMEOUT_MS", 30_000)?,
            refresh_buffer_ms: env_parse("DOCUMENT_SYNC_REFRESH_BUFFER_MS", 300_000)?,
            auto_refresh: env_parse("DOCUMENT_SYNC_AUTO_REFRESH", true)?,
            url_ttl_secs: env_parse("DOCUMENT_SYNC_URL_TTL_SECS", 3600)?,
        };

        Ok((cfg, args.command.unwrap_or(Command::Serve)))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            backoff: if self.exponential_backoff {
                RetryBackoff::Exponential
            } else {
                RetryBackoff::Fixed
            },
            timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn url_cache_config(&self) -> UrlCacheConfig {
        UrlCacheConfig {
            refresh_buffer: Duration::from_millis(self.refresh_buffer_ms),
            ttl: Duration::from_secs(self.url_ttl_secs),
            auto_refresh: self.auto_refresh,
            ..UrlCacheConfig::default()
        }
    }
}

/// The secret kept next to the objects it signs, generated on first use so
/// every process sharing a storage directory agrees on it.
pub fn load_or_create_signing_secret(storage_dir: &Path) -> Result<String> {
    let path = storage_dir.join(SIGNING_SECRET_FILE);
    match fs::read_to_string(&path) {
        Ok(secret) if !secret.trim().is_empty() => return Ok(secret.trim().to_string()),
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    }

    fs::create_dir_all(storage_dir)
        .with_context(|| format!("creating {}", storage_dir.display()))?;
    let secret = uuid::Uuid::new_v4().simple().to_string();
    fs::write(&path, &secret).with_context(|| format!("writing {}", path.display()))?;
    tracing::warn!(
        path = %path.display(),
        "DOCUMENT_SYNC_SIGNING_SECRET not set; generated a signing secret"
    );
    Ok(secret)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: StdError + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {key} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {key}")),
    }
}
