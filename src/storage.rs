//! Pluggable blob storage: a local directory or an S3 bucket, behind one
//! trait so the cache and orchestrator never see a concrete backend.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Config;
use crate::error::Error;

pub const S3_ACCESS_KEY_ENV_VAR: &str = "IMGSERV_S3_ACCESS_KEY";
pub const S3_SECRET_KEY_ENV_VAR: &str = "IMGSERV_S3_SECRET_KEY";
pub const S3_BUCKET_ENV_VAR: &str = "IMGSERV_S3_BUCKET";

/// Content-addressed blob operations shared by all backends.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, path: &str) -> Result<Bytes, Error>;

    /// Stores a blob, replacing any existing one, and returns the
    /// authoritative stored byte count.
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<u64, Error>;

    async fn delete(&self, path: &str) -> Result<(), Error>;

    async fn exists(&self, path: &str) -> bool;
}

/// Selects the backend from the environment: S3 when the credential triple
/// is fully present, the local directory otherwise.
pub async fn from_env(config: &Config) -> Arc<dyn Storage> {
    let triple = (
        env::var(S3_ACCESS_KEY_ENV_VAR),
        env::var(S3_SECRET_KEY_ENV_VAR),
        env::var(S3_BUCKET_ENV_VAR),
    );
    if let (Ok(access_key), Ok(secret_key), Ok(bucket)) = triple {
        tracing::info!(%bucket, "using s3 storage");
        return Arc::new(S3Storage::connect(access_key, secret_key, bucket).await);
    }
    tracing::info!(path = %config.local_path, "using local storage");
    Arc::new(LocalStorage::new(&config.local_path))
}

/// Blobs in a directory on the local filesystem.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalStorage { root: root.into() }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn get(&self, path: &str) -> Result<Bytes, Error> {
        match tokio::fs::read(self.full_path(path)).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, path: &str, bytes: &[u8], _content_type: &str) -> Result<u64, Error> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        match tokio::fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::metadata(self.full_path(path)).await.is_ok()
    }
}

/// Blobs in an S3 bucket.
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Storage {
    pub async fn connect(access_key: String, secret_key: String, bucket: String) -> Self {
        let credentials =
            aws_sdk_s3::config::Credentials::new(access_key, secret_key, None, None, "imgserv");
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .load()
            .await;
        S3Storage {
            client: aws_sdk_s3::Client::new(&sdk_config),
            bucket,
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn get(&self, path: &str) -> Result<Bytes, Error> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    Error::NotFound(path.to_string())
                } else {
                    Error::StorageIo(service_err.to_string())
                }
            })?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| Error::StorageIo(e.to_string()))?;
        Ok(data.into_bytes())
    }

    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<u64, Error> {
        let size = bytes.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .content_type(content_type)
            .body(aws_sdk_s3::primitives::ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| Error::StorageIo(e.into_service_error().to_string()))?;
        Ok(size)
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        // S3 deletes are idempotent; a missing key is not an error here.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| Error::StorageIo(e.into_service_error().to_string()))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .is_ok()
    }
}
