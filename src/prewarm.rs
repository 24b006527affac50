use async_trait::async_trait;
use tracing::debug;

use crate::{AssetCache, AssetCacheError, AssetHandle, AssetKey};

/// Scheduler capability injected into [`AssetCache::prewarm`].
///
/// Prewarming is a cooperative background task: after each batch of
/// acquisitions it hands control back to the host through this trait so
/// a frame-budgeted or otherwise throttled scheduler can interleave its
/// own work. The cache itself has no notion of ticks or frames.
#[async_trait]
pub trait YieldPoint: Send + Sync {
    /// Suspends the prewarm task until the host is ready for more work.
    async fn yield_now(&self);
}

/// [`YieldPoint`] backed by `tokio::task::yield_now`.
pub struct TokioYield;

#[async_trait]
impl YieldPoint for TokioYield {
    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }
}

impl AssetCache {
    /// Warms the cache by acquiring `keys` in batches, yielding to
    /// `yield_point` between batches.
    ///
    /// Batch size is set by
    /// [`AssetCacheOptions::with_prewarm_batch_size`](crate::AssetCacheOptions::with_prewarm_batch_size).
    /// Returns the handles for every key so the caller decides how long
    /// the warmed assets stay resident.
    ///
    /// # Errors
    /// On a batch failure every handle acquired by earlier batches is
    /// released before the error surfaces.
    pub async fn prewarm(
        &self,
        keys: &[AssetKey],
        yield_point: &dyn YieldPoint,
    ) -> Result<Vec<AssetHandle>, AssetCacheError> {
        let mut handles = Vec::with_capacity(keys.len());
        let mut chunks = keys.chunks(self.prewarm_batch_size).peekable();
        while let Some(chunk) = chunks.next() {
            match self.acquire_batch(chunk, None).await {
                Ok(batch) => handles.extend(batch),
                Err(err) => {
                    if let Err(release_err) = self.release_batch(&mut handles) {
                        debug!(
                            "releasing partially prewarmed handles reported: {}",
                            release_err
                        );
                    }
                    return Err(err);
                }
            }
            if chunks.peek().is_some() {
                yield_point.yield_now().await;
            }
        }
        Ok(handles)
    }
}
