//! Derived-artifact cache: blobs live in storage, membership, sizes and
//! access statistics live in the metadata store, and a byte budget is
//! enforced by background pruning.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use image::DynamicImage;
use tokio::sync::Mutex;

use crate::codec::{self, ImageFormat};
use crate::config::CachePolicy;
use crate::error::Error;
use crate::metadata::MetaStore;
use crate::params;
use crate::storage::Storage;

/// Victims considered per eviction pass.
pub const PRUNE_BATCH: usize = 5;

#[derive(Clone)]
pub struct CacheManager {
    storage: Arc<dyn Storage>,
    meta: Arc<dyn MetaStore>,
    policy: CachePolicy,
    /// Byte budget; 0 means uncapped.
    limit_bytes: u64,
    jpeg_quality: u8,
    prune_lock: Arc<Mutex<()>>,
}

impl CacheManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        meta: Arc<dyn MetaStore>,
        policy: CachePolicy,
        limit_bytes: u64,
        jpeg_quality: u8,
    ) -> Self {
        CacheManager {
            storage,
            meta,
            policy,
            limit_bytes,
            jpeg_quality,
            prune_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Cache-first read. A hit bumps the access timestamp and hit count
    /// best-effort; any metadata failure degrades to a miss rather than
    /// failing the request.
    pub async fn lookup(&self, derived_path: &str) -> Option<(Bytes, ImageFormat)> {
        match self.meta.record_exists(derived_path).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                tracing::warn!(path = %derived_path, "cache membership check failed: {e}");
                return None;
            }
        }

        let format = params::derived_ext(derived_path).and_then(ImageFormat::from_ext)?;
        let bytes = match self.storage.get(derived_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %derived_path, "cached blob unreadable: {e}");
                return None;
            }
        };

        if let Err(e) = self.meta.touch(derived_path, Utc::now().timestamp()).await {
            tracing::debug!(path = %derived_path, "access timestamp update failed: {e}");
        }
        if let Err(e) = self.meta.bump_count(derived_path).await {
            tracing::debug!(path = %derived_path, "access count update failed: {e}");
        }

        Some((bytes, format))
    }

    /// Encodes and persists a derived artifact, records it in the indices
    /// and schedules a prune. Idempotent for identical rasters: the later
    /// put overwrites byte-identically and records the same size.
    pub async fn insert(
        &self,
        derived_path: &str,
        img: &DynamicImage,
        format: ImageFormat,
    ) -> Result<(), Error> {
        let bytes = codec::encode(img, format, self.jpeg_quality)?;
        let size = self
            .storage
            .put(derived_path, &bytes, format.content_type())
            .await?;
        self.meta
            .record_insert(derived_path, size as i64, Utc::now().timestamp())
            .await?;
        tracing::debug!(path = %derived_path, size, "cached derived image");
        self.schedule_prune();
        Ok(())
    }

    /// Removes an artifact: blob first, then the metadata record. When the
    /// blob removal fails the record is left intact so the aggregate stays
    /// truthful. Returns whether a record was actually removed.
    pub async fn remove(&self, derived_path: &str) -> Result<bool, Error> {
        let Some(size) = self.meta.record_size(derived_path).await? else {
            // Vanished between selection and removal.
            return Ok(false);
        };
        match self.storage.delete(derived_path).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.meta.record_remove(derived_path, size).await?;
        Ok(true)
    }

    /// Fire-and-forget prune. Concurrent schedules coalesce onto whichever
    /// task holds the lock.
    pub fn schedule_prune(&self) {
        if self.limit_bytes == 0 {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.prune().await {
                tracing::warn!("cache prune failed: {e}");
            }
        });
    }

    /// Evicts ascending-score victims from the policy index until the
    /// aggregate size fits the budget. No-op when the budget is 0.
    pub async fn prune(&self) -> Result<(), Error> {
        if self.limit_bytes == 0 {
            return Ok(());
        }
        let Ok(_guard) = self.prune_lock.try_lock() else {
            return Ok(());
        };

        loop {
            let mut total = self.meta.total_cache_size().await?;
            if total <= self.limit_bytes as i64 {
                return Ok(());
            }

            let victims = self.meta.victims(self.policy, PRUNE_BATCH).await?;
            if victims.is_empty() {
                return Ok(());
            }

            let mut removed_any = false;
            for victim in victims {
                if total <= self.limit_bytes as i64 {
                    break;
                }
                match self.remove(&victim).await {
                    Ok(true) => {
                        removed_any = true;
                        tracing::info!(path = %victim, "evicted from cache");
                        total = self.meta.total_cache_size().await?;
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(path = %victim, "eviction failed: {e}"),
                }
            }
            if !removed_any {
                // Every victim vanished or refused to go; give up rather
                // than spin on a stuck index.
                return Ok(());
            }
        }
    }
}
