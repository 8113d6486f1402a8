use async_trait::async_trait;
use axum::body::Bytes;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

use crate::config::AppConfig;

/// Range size used when streaming an object back from R2.
const DOWNLOAD_CHUNK: u64 = 1024 * 1024;
const RANGE_ATTEMPTS: u32 = 3;
const RANGE_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Readable handle on a stored file.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Durable storage for uploaded files. Stored blobs are never modified.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    /// Open a stored file for streaming, starting `offset` bytes in.
    async fn open(&self, key: &str, offset: u64) -> Result<BlobReader, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Pick the configured backend: R2 when a bucket is set, local disk otherwise.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn BlobStore>, StorageError> {
    match config.r2() {
        Some(r2) => {
            tracing::info!(bucket = %r2.bucket, "Using R2 object storage for uploads");
            Ok(Arc::new(R2Client::new(
                r2.bucket,
                r2.endpoint,
                r2.access_key,
                r2.secret_key,
            )?))
        }
        None => {
            tracing::info!(dir = %config.storage_dir, "Using local directory for uploads");
            Ok(Arc::new(LocalStorage::new(&config.storage_dir)))
        }
    }
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Arc<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            bucket: Arc::from(bucket),
        })
    }

    async fn object_size(&self, key: &str) -> Result<u64, StorageError> {
        let (head, code) = self.bucket.head_object(key).await?;
        match code {
            200 => Ok(head.content_length.unwrap_or(0).max(0) as u64),
            404 => Err(StorageError::NotFound(key.to_string())),
            code => Err(StorageError::Status {
                key: key.to_string(),
                code,
            }),
        }
    }
}

#[async_trait]
impl BlobStore for R2Client {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        match response.status_code() {
            200 => Ok(()),
            code => Err(StorageError::Status {
                key: key.to_string(),
                code,
            }),
        }
    }

    async fn open(&self, key: &str, offset: u64) -> Result<BlobReader, StorageError> {
        let size = self.object_size(key).await?;
        let bucket = self.bucket.clone();
        let key = key.to_string();

        // Ranged GETs keep memory bounded to one chunk per open file.
        let chunks = futures::stream::try_unfold(offset, move |start| {
            let bucket = bucket.clone();
            let key = key.clone();
            async move {
                if start >= size {
                    return Ok::<_, std::io::Error>(None);
                }
                let end = (start + DOWNLOAD_CHUNK - 1).min(size - 1);
                let chunk = fetch_range(&bucket, &key, start, end).await?;
                Ok(Some((chunk, end + 1)))
            }
        });

        Ok(Box::new(StreamReader::new(Box::pin(chunks))))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(key).await?;
        delete_status(key, response.status_code())
    }
}

/// An object that is already gone counts as deleted.
fn delete_status(key: &str, code: u16) -> Result<(), StorageError> {
    match code {
        200..=299 | 404 => Ok(()),
        code => Err(StorageError::Status {
            key: key.to_string(),
            code,
        }),
    }
}

/// Throttling and server-side failures are worth another attempt.
fn retryable_status(code: u16) -> bool {
    code == 429 || (500..600).contains(&code)
}

/// One chunk of an object, retried a few times so a single failed request
/// does not fail the whole file.
async fn fetch_range(bucket: &Bucket, key: &str, start: u64, end: u64) -> std::io::Result<Bytes> {
    let mut attempt = 1;
    loop {
        let failure = match bucket.get_object_range(key, start, Some(end)).await {
            Ok(response) => match response.status_code() {
                200 | 206 => return Ok(Bytes::from(response.to_vec())),
                code => {
                    let message = format!("range request for {} returned {}", key, code);
                    if !retryable_status(code) {
                        return Err(std::io::Error::other(message));
                    }
                    message
                }
            },
            Err(e) => e.to_string(),
        };
        if attempt >= RANGE_ATTEMPTS {
            return Err(std::io::Error::other(failure));
        }
        tracing::warn!(key, start, attempt, error = %failure, "Range request failed, retrying");
        tokio::time::sleep(RANGE_RETRY_BACKOFF * attempt).await;
        attempt += 1;
    }
}

/// Uploads kept under a local directory; for single-host deployments and development.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalStorage {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never observe a partial file.
        let staging = path.with_extension("partial");
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn open(&self, key: &str, offset: u64) -> Result<BlobReader, StorageError> {
        let path = self.path_for(key)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage returned status {code} for {key}")]
    Status { key: String, code: u16 },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}
