use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{AssetCache, AssetCacheError, AssetHandle, AssetKey};

/// The chain of keys currently being resolved on one load attempt's call
/// path, root first.
///
/// Every acquire extends the chain; a key that is already on it closes a
/// cycle and fails the attempt instead of deadlocking on its own waiter
/// list. The chain is also the depth bound for runaway dependency graphs.
#[derive(Clone, Debug, Default)]
pub(crate) struct ResolutionPath {
    keys: Vec<AssetKey>,
}

impl ResolutionPath {
    pub(crate) fn root() -> Self {
        Self::default()
    }

    /// Extends the chain with `key`, failing on a cycle or when the chain
    /// outgrows `max_depth`.
    pub(crate) fn push(
        &self,
        key: &AssetKey,
        max_depth: usize,
    ) -> Result<Self, AssetCacheError> {
        if self.keys.contains(key) || self.keys.len() >= max_depth {
            return Err(AssetCacheError::DependencyCycle {
                key: key.clone(),
                chain: format!("{} -> {}", self, key),
            });
        }
        let mut keys = self.keys.clone();
        keys.push(key.clone());
        Ok(Self { keys })
    }
}

impl fmt::Display for ResolutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.keys.is_empty() {
            return f.write_str("(root)");
        }
        for (index, key) in self.keys.iter().enumerate() {
            if index > 0 {
                f.write_str(" -> ")?;
            }
            fmt::Display::fmt(key, f)?;
        }
        Ok(())
    }
}

/// Acquires every declared dependency of `primary` through the public
/// acquire path, in declaration order.
///
/// Going through [`AssetCache::acquire`] (and not a private shortcut) makes
/// dependency refcounts indistinguishable from directly-requested ones and
/// reuses the coalescing machinery. On any failure, dependencies already
/// acquired by this attempt are rolled back before the error propagates.
pub(crate) async fn acquire_all(
    cache: &AssetCache,
    primary: &AssetKey,
    declared: &[AssetKey],
    path: &ResolutionPath,
    cancel: &CancellationToken,
) -> Result<Vec<AssetHandle>, AssetCacheError> {
    let mut acquired = Vec::with_capacity(declared.len());
    for dependency in declared {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(AssetCacheError::Cancelled(primary.clone())),
            result = cache.acquire_with_path(dependency.clone(), path.clone()) => result,
        };
        match result {
            Ok(handle) => acquired.push(handle),
            Err(err) => {
                rollback(cache, acquired);
                return Err(err);
            }
        }
    }
    Ok(acquired)
}

/// Releases dependencies acquired by a failed attempt, in reverse
/// acquisition order.
pub(crate) fn rollback(cache: &AssetCache, mut acquired: Vec<AssetHandle>) {
    while let Some(mut handle) = acquired.pop() {
        if let Err(err) = cache.release(&mut handle) {
            warn!("rollback failed to release '{}': {}", handle.key(), err);
        }
    }
}
