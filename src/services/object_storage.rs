//! src/services/object_storage.rs
//!
//! LocalObjectStorage: an `ObjectStorage` backed by a directory tree laid out
//! as `base_path/{bucket}/{path}`. Uploads stream into a temp file next to
//! the destination and are renamed into place once fsynced. Signed URLs
//! point at the `/objects` route served by this crate and carry an
//! HMAC-SHA256 signature over `bucket/path:expires`.

use crate::{
    models::{
        signed_url::SignedUrl,
        storage::{ListOptions, StorageEntry, UploadOptions, UploadedObject},
    },
    services::remote::{ObjectStorage, ProgressFn, StorageError, StorageResult},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use md5::Context;
use sha2::Sha256;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_OBJECT_PATH_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;
const TEMP_PREFIX: &str = ".tmp-";

#[derive(Clone)]
pub struct LocalObjectStorage {
    base_path: PathBuf,
    public_url: String,
    signing_secret: Vec<u8>,
    max_object_bytes: Option<u64>,
}

impl LocalObjectStorage {
    /// `public_url` is the externally reachable root of the HTTP surface,
    /// e.g. `http://127.0.0.1:3000`.
    pub fn new(
        base_path: impl Into<PathBuf>,
        public_url: impl Into<String>,
        signing_secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            signing_secret: signing_secret.into(),
            max_object_bytes: None,
        }
    }

    /// Reject uploads larger than `limit` with `StorageError::PayloadTooLarge`.
    pub fn with_max_object_bytes(mut self, limit: u64) -> Self {
        self.max_object_bytes = Some(limit);
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Rejects empty paths, absolute paths, `..` segments and control bytes.
    fn ensure_path_safe(&self, path: &str) -> StorageResult<()> {
        let invalid = path.is_empty()
            || path.len() > MAX_OBJECT_PATH_LEN
            || path.starts_with('/')
            || path.ends_with('/')
            || path.split('/').any(|segment| {
                segment.is_empty() || segment == ".." || segment.starts_with(TEMP_PREFIX)
            })
            || path
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(())
    }

    /// 3 to 63 characters of lowercase letters, digits, dots and hyphens,
    /// starting and ending with a letter or digit.
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let reason = if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
            Some("must be between 3 and 63 characters")
        } else if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            Some("allowed characters are lowercase letters, digits, dots, and hyphens")
        } else if !name.starts_with(|c: char| c.is_ascii_alphanumeric())
            || !name.ends_with(|c: char| c.is_ascii_alphanumeric())
        {
            Some("must start and end with a lowercase letter or digit")
        } else if name.contains("..") {
            Some("cannot contain consecutive dots")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: reason.into(),
            }),
            None => Ok(()),
        }
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    fn object_path(&self, bucket: &str, path: &str) -> PathBuf {
        let mut full = self.bucket_root(bucket);
        full.extend(path.split('/'));
        full
    }

    fn sign(&self, bucket: &str, path: &str, expires: i64) -> StorageResult<String> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_secret)
            .map_err(|err| StorageError::Signing(err.to_string()))?;
        mac.update(format!("{bucket}/{path}:{expires}").as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    /// Check a signature produced by `issue_signed_url`.
    ///
    /// Fails with `PermissionDenied` when the signature does not match or
    /// `expires` (unix seconds) is in the past.
    pub fn verify_signed_request(
        &self,
        bucket: &str,
        path: &str,
        expires: i64,
        signature: &str,
    ) -> StorageResult<()> {
        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| StorageError::PermissionDenied("malformed signature".into()))?;
        let mut mac = HmacSha256::new_from_slice(&self.signing_secret)
            .map_err(|err| StorageError::Signing(err.to_string()))?;
        mac.update(format!("{bucket}/{path}:{expires}").as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| StorageError::PermissionDenied("signature mismatch".into()))?;

        if Utc::now().timestamp() > expires {
            return Err(StorageError::PermissionDenied("signed url expired".into()));
        }
        Ok(())
    }

    /// Open an object for streaming out. Returns the file and its size.
    pub async fn open_object(&self, bucket: &str, path: &str) -> StorageResult<(File, u64)> {
        self.ensure_bucket_name_safe(bucket)?;
        self.ensure_path_safe(path)?;
        let file_path = self.object_path(bucket, path);
        let file = File::open(&file_path)
            .await
            .map_err(|err| not_found_or_io(err, bucket, path))?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Recursively remove empty directories up to the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        options: UploadOptions,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> StorageResult<UploadedObject> {
        self.ensure_bucket_name_safe(bucket)?;
        self.ensure_path_safe(path)?;
        let size = bytes.len() as u64;
        if let Some(limit) = self.max_object_bytes {
            if size > limit {
                return Err(StorageError::PayloadTooLarge { size, limit });
            }
        }

        let file_path = self.object_path(bucket, path);
        if !options.upsert && fs::try_exists(&file_path).await? {
            return Err(StorageError::AlreadyExists {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }

        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let start = std::time::Instant::now();
        let mut tmp = TempFile::new(parent.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4())));
        let mut file = File::create(tmp.path()).await?;

        let mut written: u64 = 0;
        let mut digest = Context::new();
        for chunk in bytes.chunks(UPLOAD_CHUNK_BYTES) {
            if cancel.is_cancelled() {
                debug!(bucket = %bucket, path = %path, written, "upload cancelled mid-transfer");
                return Err(StorageError::Cancelled);
            }
            file.write_all(chunk).await?;
            digest.consume(chunk);
            written += chunk.len() as u64;
            progress(written);
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(tmp.path(), &file_path).await {
            if err.kind() != ErrorKind::AlreadyExists {
                return Err(StorageError::Io(err));
            }
            fs::remove_file(&file_path).await?;
            fs::rename(tmp.path(), &file_path).await?;
        }
        tmp.persisted();

        let etag = format!("{:x}", digest.compute());
        info!(
            bucket = %bucket,
            path = %path,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local object upload successful"
        );

        Ok(UploadedObject {
            path: path.to_string(),
            size,
            etag: Some(etag),
        })
    }

    async fn issue_signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> StorageResult<SignedUrl> {
        self.ensure_bucket_name_safe(bucket)?;
        self.ensure_path_safe(path)?;
        let file_path = self.object_path(bucket, path);
        if !fs::try_exists(&file_path).await? {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }

        let expires = Utc::now().timestamp() + ttl.as_secs().max(1) as i64;
        let signature = self.sign(bucket, path, expires)?;
        let expires_at = Utc
            .timestamp_opt(expires, 0)
            .single()
            .ok_or_else(|| StorageError::Signing(format!("expiry {expires} out of range")))?;

        Ok(SignedUrl {
            url: format!(
                "{}/objects/{}/{}?expires={}&signature={}",
                self.public_url,
                bucket,
                encode_path(path),
                expires,
                signature
            ),
            expires_at,
        })
    }

    async fn issue_signed_urls(
        &self,
        bucket: &str,
        paths: &[String],
        ttl: Duration,
    ) -> StorageResult<Vec<(String, StorageResult<SignedUrl>)>> {
        self.ensure_bucket_name_safe(bucket)?;
        let mut issued = Vec::with_capacity(paths.len());
        for path in paths {
            let result = self.issue_signed_url(bucket, path, ttl).await;
            issued.push((path.clone(), result));
        }
        Ok(issued)
    }

    async fn list(
        &self,
        bucket: &str,
        folder: &str,
        options: ListOptions,
    ) -> StorageResult<Vec<StorageEntry>> {
        self.ensure_bucket_name_safe(bucket)?;
        let folder = folder.trim_matches('/');
        if !folder.is_empty() {
            self.ensure_path_safe(folder)?;
        }

        let bucket_root = self.bucket_root(bucket);
        let mut pending = vec![if folder.is_empty() {
            bucket_root.clone()
        } else {
            self.object_path(bucket, folder)
        }];
        let mut entries = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::Io(err)),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&bucket_root).map(Path::to_path_buf)
                else {
                    continue;
                };
                entries.push(StorageEntry {
                    path: relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                    size: metadata.len(),
                    updated_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries
            .into_iter()
            .skip(options.offset)
            .take(options.limit.max(1))
            .collect())
    }

    async fn delete(&self, bucket: &str, paths: &[String]) -> StorageResult<()> {
        self.ensure_bucket_name_safe(bucket)?;
        let bucket_root = self.bucket_root(bucket);
        let mut first_error = None;

        for path in paths {
            if let Err(err) = self.ensure_path_safe(path) {
                first_error.get_or_insert(err);
                continue;
            }
            let file_path = self.object_path(bucket, path);
            match fs::remove_file(&file_path).await {
                Ok(_) => debug!("removed object {}", file_path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("object {} already missing", file_path.display());
                    continue;
                }
                Err(err) => {
                    first_error.get_or_insert(StorageError::Io(err));
                    continue;
                }
            }
            if let Some(parent) = file_path.parent() {
                self.prune_empty_dirs(parent, &bucket_root).await;
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Temp file removed on drop unless `persisted` was called.
struct TempFile {
    path: PathBuf,
    keep: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persisted(&mut self) {
        self.keep = true;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn not_found_or_io(err: io::Error, bucket: &str, path: &str) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            path: path.to_string(),
        }
    } else {
        StorageError::Io(err)
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set, keeping `/`.
fn encode_path(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}
