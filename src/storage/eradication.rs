//! Object Eradication Engine
//!
//! Empties a bucket, or a prefix inside one, in two tiers:
//! - batched bulk deletes over the listing, chunked to the bulk call limit
//! - if any batch fails, a fresh listing removed object by object with a
//!   bounded number of deletes in flight
//!
//! Failures of the per-object tier are counted, not collected, and only
//! evaluated once every dispatched delete has finished.

use crate::domain::ports::{ObjectInfo, ObjectStore, ObjectStoreRef};
use crate::error::{Error, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Eradication tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EradicationConfig {
    /// Maximum per-object deletes in flight
    pub parallelism: usize,
    /// Keys per bulk delete call
    pub batch_size: usize,
}

impl Default for EradicationConfig {
    fn default() -> Self {
        Self {
            parallelism: 16,
            batch_size: 1000,
        }
    }
}

/// Tier that completed an eradication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EradicationStrategy {
    Batch,
    PerObject,
}

impl EradicationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EradicationStrategy::Batch => "batch",
            EradicationStrategy::PerObject => "per_object",
        }
    }
}

/// Summary of a successful eradication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EradicationReport {
    pub strategy: EradicationStrategy,
    /// Objects removed, prefix marker excluded
    pub removed: u64,
}

/// Listing prefix for a volume prefix: empty for a whole bucket, else
/// slash-terminated so `pvc-1` never matches `pvc-10`
pub fn listing_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

enum BatchOutcome {
    Done(u64),
    Failed(String),
}

// =============================================================================
// Engine
// =============================================================================

/// Bulk deletion of everything under a bucket or prefix
#[derive(Debug, Clone, Default)]
pub struct EradicationEngine {
    config: EradicationConfig,
}

impl EradicationEngine {
    pub fn new(config: EradicationConfig) -> Self {
        Self { config }
    }

    /// Remove every object under `prefix` in `bucket`, then the prefix
    /// marker itself. Listing errors abort immediately.
    pub async fn delete_all(
        &self,
        store: &ObjectStoreRef,
        bucket: &str,
        prefix: &str,
    ) -> Result<EradicationReport> {
        let list_prefix = listing_prefix(prefix);
        info!(
            "Removing all objects of bucket {} under '{}'",
            bucket, list_prefix
        );

        let report = match self.remove_batched(store.as_ref(), bucket, &list_prefix).await? {
            BatchOutcome::Done(removed) => EradicationReport {
                strategy: EradicationStrategy::Batch,
                removed,
            },
            BatchOutcome::Failed(reason) => {
                warn!(
                    "Batch removal in bucket {} failed: {}, removing objects one by one",
                    bucket, reason
                );
                let (total, failed) = self.remove_one_by_one(store, bucket, &list_prefix).await?;
                if failed > 0 {
                    return Err(Error::EradicationIncomplete {
                        bucket: bucket.to_string(),
                        failed,
                        total,
                    });
                }
                EradicationReport {
                    strategy: EradicationStrategy::PerObject,
                    removed: total,
                }
            }
        };

        if !list_prefix.is_empty() {
            store
                .remove_object(bucket, &ObjectInfo::new(list_prefix.as_str()))
                .await?;
        }

        info!(
            "Removed {} objects of bucket {} ({})",
            report.removed,
            bucket,
            report.strategy.as_str()
        );
        Ok(report)
    }

    /// Empty a prefix inside a bucket
    pub async fn delete_prefix(
        &self,
        store: &ObjectStoreRef,
        bucket: &str,
        prefix: &str,
    ) -> Result<EradicationReport> {
        if listing_prefix(prefix).is_empty() {
            return Err(Error::InvalidArgument(format!(
                "empty prefix for bucket {}",
                bucket
            )));
        }
        self.delete_all(store, bucket, prefix).await
    }

    /// Empty and remove a bucket. A bucket that is already gone is not an
    /// error and yields no report.
    pub async fn delete_bucket(
        &self,
        store: &ObjectStoreRef,
        bucket: &str,
    ) -> Result<Option<EradicationReport>> {
        let report = match self.delete_all(store, bucket, "").await {
            Ok(report) => report,
            Err(Error::BucketNotFound { .. }) => {
                info!("Bucket {} does not exist, nothing to delete", bucket);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match store.remove_bucket(bucket).await {
            Ok(()) => info!("Removed bucket {}", bucket),
            Err(Error::BucketNotFound { .. }) => {
                debug!("Bucket {} vanished before removal", bucket)
            }
            Err(e) => return Err(e),
        }
        Ok(Some(report))
    }

    /// Batched tier. `Ok(Failed)` asks for the per-object tier, `Err` is a
    /// listing failure.
    async fn remove_batched(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        prefix: &str,
    ) -> Result<BatchOutcome> {
        let batch_size = self.config.batch_size.max(1);
        let mut listing = store.list_objects(bucket, prefix);
        let mut chunk = Vec::with_capacity(batch_size);
        let mut removed = 0u64;

        loop {
            let next = listing.next().await.transpose()?;
            let exhausted = next.is_none();
            if let Some(object) = next {
                chunk.push(object);
            }
            if chunk.is_empty() || (!exhausted && chunk.len() < batch_size) {
                if exhausted {
                    break;
                }
                continue;
            }

            match store.remove_objects(bucket, &chunk).await {
                Ok(failures) if failures.is_empty() => {
                    removed += chunk.len() as u64;
                    debug!("Removed batch of {} objects from {}", chunk.len(), bucket);
                    chunk.clear();
                }
                Ok(failures) => {
                    for failure in &failures {
                        warn!(
                            "Failed to remove object {} from {}: {}",
                            failure.key, bucket, failure.reason
                        );
                    }
                    return Ok(BatchOutcome::Failed(format!(
                        "{} of {} objects rejected",
                        failures.len(),
                        chunk.len()
                    )));
                }
                Err(e) => return Ok(BatchOutcome::Failed(e.to_string())),
            }

            if exhausted {
                break;
            }
        }

        Ok(BatchOutcome::Done(removed))
    }

    /// Per-object tier, returns `(total, failed)`
    async fn remove_one_by_one(
        &self,
        store: &ObjectStoreRef,
        bucket: &str,
        prefix: &str,
    ) -> Result<(u64, u64)> {
        let parallelism = self.config.parallelism.max(1);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let total = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let mut tasks = JoinSet::new();
        let mut list_error = None;

        let mut listing = store.list_objects(bucket, prefix);
        while let Some(item) = listing.next().await {
            let object = match item {
                Ok(object) => object,
                Err(e) => {
                    list_error = Some(e);
                    break;
                }
            };
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(format!("delete semaphore closed: {}", e)))?;
            total.fetch_add(1, Ordering::Relaxed);

            let store = store.clone();
            let bucket = bucket.to_string();
            let task_failed = failed.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = store.remove_object(&bucket, &object).await {
                    warn!("Failed to remove object {} from {}: {}", object.key, bucket, e);
                    task_failed.fetch_add(1, Ordering::Relaxed);
                }
            });

            // Keep finished handles from piling up on huge listings
            if tasks.len() >= parallelism * 2 {
                if let Some(Err(e)) = tasks.join_next().await {
                    warn!("Delete task failed: {}", e);
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        drop(listing);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Delete task failed: {}", e);
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(e) = list_error {
            return Err(e);
        }
        Ok((total.load(Ordering::Relaxed), failed.load(Ordering::Relaxed)))
    }
}
