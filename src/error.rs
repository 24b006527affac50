use std::sync::Arc;

use crate::AssetKey;

/// Error type for the asset cache.
///
/// Variants are `Clone` so a single load failure can be fanned out to every
/// coalesced waiter of the same physical load.
#[derive(thiserror::Error, Debug, Clone)]
pub enum AssetCacheError {
    /// No registered load strategy resolves the key.
    #[error("no load strategy registered for '{0}'")]
    NoStrategy(AssetKey),

    /// The loaded payload is not of the type the caller expected.
    #[error("payload for '{key}' is not a '{expected}'")]
    TypeMismatch {
        /// Key whose payload failed the downcast.
        key: AssetKey,
        /// Type name the caller asked for.
        expected: &'static str,
    },

    /// The dependency graph cycles back on itself, or the resolution chain
    /// exceeds the configured maximum depth.
    #[error("dependency cycle detected while resolving '{key}' (chain: {chain})")]
    DependencyCycle {
        /// Key that closed the cycle or broke the depth limit.
        key: AssetKey,
        /// The resolution chain of the failing attempt.
        chain: String,
    },

    /// The load was cancelled before it could complete.
    #[error("load of '{0}' was cancelled")]
    Cancelled(AssetKey),

    /// Opaque failure reported by the backend strategy.
    #[error("strategy failed for '{0}': {1}")]
    StrategyError(AssetKey, Arc<dyn std::error::Error + Send + Sync>),

    /// A handle was released more than once. This is a programmer error
    /// upstream (use-after-release); it is reported loudly, never ignored.
    #[error("handle for '{0}' was already released")]
    DoubleRelease(AssetKey),

    /// One or more members of a batch operation failed. Reports the first
    /// failure plus how many other members also failed, so blame is not
    /// pinned on a single key when many fail for the same root cause.
    #[error("batch failed: {first} ({additional} other member(s) also failed)")]
    BatchFailed {
        /// First failure observed, in member order.
        first: Box<AssetCacheError>,
        /// Number of additional members that failed.
        additional: usize,
    },
}

impl AssetCacheError {
    /// Wraps an opaque backend error for `key`.
    pub fn strategy(
        key: AssetKey,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StrategyError(key, Arc::new(err))
    }
}
