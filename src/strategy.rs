use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{Asset, AssetCacheError, AssetKey};

/// A pluggable backend responsible for fetching, deserializing and unloading
/// payloads.
///
/// The cache does not care whether a strategy performs blocking or async
/// I/O, only that it observes the cancellation token and returns promptly
/// once it fires.
#[async_trait]
pub trait LoadStrategy: Send + Sync {
    /// Returns the keys `key` requires to be loaded before its own payload
    /// is fetched, in declaration order.
    ///
    /// The declaration is consumed once per load attempt; the cache persists
    /// the resolved form as the record's owned dependency handles.
    ///
    /// # Errors
    /// Returns `AssetCacheError` if the backend cannot describe the asset.
    async fn declare_dependencies(
        &self,
        _key: &AssetKey,
        _cancel: &CancellationToken,
    ) -> Result<Vec<AssetKey>, AssetCacheError> {
        Ok(vec![])
    }

    /// Fetches and deserializes the payload for `key`.
    ///
    /// Called after every declared dependency has been acquired.
    ///
    /// # Errors
    /// Returns `AssetCacheError` on backend failure.
    async fn load(
        &self,
        key: &AssetKey,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Asset>, AssetCacheError>;

    /// Releases the payload for `key`.
    ///
    /// Called exactly once per published payload, after the last handle was
    /// released. Must tolerate a payload that the hosting runtime has
    /// already partially torn down.
    async fn unload(&self, _key: &AssetKey, _payload: Arc<dyn Asset>) {}
}

/// Registration table mapping key prefixes to strategies.
///
/// First matching prefix wins; an empty prefix acts as a catch-all. The
/// table is built at configuration time and immutable afterwards, so lookups
/// need no locking.
pub(crate) struct StrategyTable {
    entries: Vec<(String, Arc<dyn LoadStrategy>)>,
}

impl StrategyTable {
    pub(crate) fn new(entries: Vec<(String, Arc<dyn LoadStrategy>)>) -> Self {
        Self { entries }
    }

    pub(crate) fn resolve(&self, key: &AssetKey) -> Option<Arc<dyn LoadStrategy>> {
        self.entries
            .iter()
            .find(|(prefix, _)| key.as_str().starts_with(prefix.as_str()))
            .map(|(_, strategy)| Arc::clone(strategy))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::{LoadStrategy, StrategyTable};
    use crate::{Asset, AssetCacheError, AssetKey};

    struct Tagged(&'static str);

    #[async_trait]
    impl LoadStrategy for Tagged {
        async fn load(
            &self,
            _key: &AssetKey,
            _cancel: &CancellationToken,
        ) -> Result<Arc<dyn Asset>, AssetCacheError> {
            Ok(Arc::new(self.0))
        }
    }

    fn tag_of(strategy: &Arc<dyn LoadStrategy>) -> &'static str {
        // resolve() clones the Arc, so compare through a test-only probe
        futures::executor::block_on(strategy.load(
            &AssetKey::new("probe"),
            &CancellationToken::new(),
        ))
        .unwrap()
        .as_ref()
        .as_any()
        .downcast_ref::<&'static str>()
        .copied()
        .unwrap()
    }

    #[test]
    fn first_matching_prefix_wins() {
        let table = StrategyTable::new(vec![
            ("textures/".to_string(), Arc::new(Tagged("tex")) as _),
            ("".to_string(), Arc::new(Tagged("any")) as _),
        ]);

        let tex = table.resolve(&AssetKey::new("textures/grass.png")).unwrap();
        assert_eq!(tag_of(&tex), "tex");

        let other = table.resolve(&AssetKey::new("audio/theme.ogg")).unwrap();
        assert_eq!(tag_of(&other), "any");
    }

    #[test]
    fn no_match_resolves_to_none() {
        let table = StrategyTable::new(vec![(
            "textures/".to_string(),
            Arc::new(Tagged("tex")) as _,
        )]);
        assert!(table.resolve(&AssetKey::new("audio/theme.ogg")).is_none());
    }
}
