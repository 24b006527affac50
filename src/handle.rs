use std::{fmt, sync::Arc};

use tracing::warn;

use crate::{Asset, AssetKey};

/// An owning handle over a loaded asset; one unit of the record's refcount.
///
/// Handles are deliberately not `Clone`: a new unit of ownership is only
/// obtained by going through [`AssetCache::acquire`] again, so every
/// increment has a matching release. The only valid way out of a handle is
/// [`AssetCache::release`] (or `release_batch`); dropping an unreleased
/// handle is a leak and trips the debug-mode leak detector.
///
/// [`AssetCache::acquire`]: crate::AssetCache::acquire
/// [`AssetCache::release`]: crate::AssetCache::release
pub struct AssetHandle {
    key: AssetKey,
    generation: u64,
    payload: Arc<dyn Asset>,
    released: bool,
}

impl AssetHandle {
    pub(crate) fn new(key: AssetKey, generation: u64, payload: Arc<dyn Asset>) -> Self {
        Self {
            key,
            generation,
            payload,
            released: false,
        }
    }

    /// Returns the key this handle was acquired for.
    pub fn key(&self) -> &AssetKey {
        &self.key
    }

    /// Retrieves the payload as `T`, if that is what the strategy produced.
    pub fn downcast_ref<T: Asset>(&self) -> Option<&T> {
        // deref to the trait object first; `Arc<dyn Asset>` is itself
        // `Any + Send + Sync` and would shadow the payload's `as_any`
        self.payload.as_ref().as_any().downcast_ref::<T>()
    }

    /// Returns the untyped payload.
    pub fn payload(&self) -> &Arc<dyn Asset> {
        &self.payload
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn mark_released(&mut self) {
        self.released = true;
    }
}

impl fmt::Debug for AssetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetHandle")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for AssetHandle {
    fn drop(&mut self) {
        // debug-only diagnostic; a leaked handle keeps its record's refcount
        // above zero forever but is not a hard failure
        if cfg!(debug_assertions) && !self.released {
            warn!(
                "asset handle for '{}' dropped without being released",
                self.key
            );
        }
    }
}
