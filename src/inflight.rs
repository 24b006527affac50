use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{AssetCacheError, AssetHandle, AssetKey};

pub(crate) type WaiterId = u64;
pub(crate) type LoadResult = Result<AssetHandle, AssetCacheError>;

struct Waiter {
    id: WaiterId,
    tx: oneshot::Sender<LoadResult>,
}

/// One entry per physical load in flight.
pub(crate) struct InFlightLoad {
    waiters: Vec<Waiter>,
    pub(crate) cancel: CancellationToken,
}

impl InFlightLoad {
    /// Completes every waiter with its own copy of the result, returning how
    /// many were still listening. Waiters whose receiving side is already
    /// gone are not counted.
    pub(crate) fn complete_with(self, mut make_result: impl FnMut() -> LoadResult) -> usize {
        let mut delivered = 0;
        for waiter in self.waiters {
            match waiter.tx.send(make_result()) {
                Ok(()) => delivered += 1,
                Err(unclaimed) => {
                    // receiver gone; reclaim the handle so it does not
                    // count as leaked
                    if let Ok(mut handle) = unclaimed {
                        handle.mark_released();
                    }
                }
            }
        }
        delivered
    }
}

/// Registry of loads currently in flight, keyed by asset key.
///
/// Per key the lifecycle is: absent, then created exactly once for the
/// physical load, then taken on resolution. While present, every new
/// acquire for the key registers a waiter here instead of starting another
/// load; that is the coalescing guarantee.
///
/// Lives inside the cache's table lock; none of these methods block.
#[derive(Default)]
pub(crate) struct InFlightLoadRegistry {
    entries: HashMap<AssetKey, InFlightLoad>,
    next_waiter: WaiterId,
}

impl InFlightLoadRegistry {
    /// Creates the entry for a new physical load and returns its
    /// cancellation token.
    pub(crate) fn begin(&mut self, key: AssetKey) -> CancellationToken {
        let cancel = CancellationToken::new();
        let previous = self.entries.insert(
            key,
            InFlightLoad {
                waiters: Vec::new(),
                cancel: cancel.clone(),
            },
        );
        assert!(previous.is_none(), "duplicate in-flight load");
        cancel
    }

    /// Registers a waiter on the in-flight load for `key`.
    pub(crate) fn register_waiter(
        &mut self,
        key: &AssetKey,
    ) -> Option<(WaiterId, oneshot::Receiver<LoadResult>)> {
        let entry = self.entries.get_mut(key)?;
        let id = self.next_waiter;
        self.next_waiter += 1;
        let (tx, rx) = oneshot::channel();
        entry.waiters.push(Waiter { id, tx });
        Some((id, rx))
    }

    /// Removes a single waiter without affecting the others. When the last
    /// waiter leaves, the physical load's cancellation token fires.
    ///
    /// Returns `false` if the load already resolved (entry gone).
    pub(crate) fn remove_waiter(&mut self, key: &AssetKey, id: WaiterId) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        let before = entry.waiters.len();
        entry.waiters.retain(|waiter| waiter.id != id);
        if entry.waiters.len() == before {
            return false;
        }
        if entry.waiters.is_empty() {
            entry.cancel.cancel();
        }
        true
    }

    /// Takes the entry on resolution; the caller fans the result out.
    pub(crate) fn complete(&mut self, key: &AssetKey) -> Option<InFlightLoad> {
        self.entries.remove(key)
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self, key: &AssetKey) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.waiters.len())
    }
}
