use std::sync::Arc;

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::sync::oneshot;

use crate::{Asset, AssetHandle};

/// Future that resolves once an in-progress unload has finished; cloned out
/// to every acquire that races the unload of the same key.
pub(crate) type UnloadDone = Shared<BoxFuture<'static, ()>>;

/// Lifecycle of a cache record.
pub(crate) enum RecordState {
    /// A physical load is in flight; callers park in the in-flight registry.
    Loading,
    /// The payload is published and shared read-only.
    Ready {
        payload: Arc<dyn Asset>,
        /// Handles this record owns on its own dependencies, in acquisition
        /// order. Released exactly once, when the record leaves `Ready`.
        dependencies: Vec<AssetHandle>,
    },
    /// The strategy unload is running; new acquires for the key wait for
    /// `done` before starting a fresh load.
    Unloading { done: UnloadDone },
}

/// Per-key bookkeeping entry, owned exclusively by the cache table.
///
/// A failed load is not represented here: failed records are evicted
/// immediately so a later acquire gets a fresh attempt.
pub(crate) struct AssetRecord {
    pub(crate) state: RecordState,
    pub(crate) refcount: u32,
    /// Stamped into every handle of this incarnation; a stale handle from an
    /// earlier incarnation of the same key cannot touch this record.
    pub(crate) generation: u64,
}

impl AssetRecord {
    pub(crate) fn loading(generation: u64) -> Self {
        Self {
            state: RecordState::Loading,
            refcount: 0,
            generation,
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(self.state, RecordState::Ready { .. })
    }

    /// Publishes a loaded payload together with the dependency handles the
    /// load attempt acquired on the record's behalf.
    pub(crate) fn publish(&mut self, payload: Arc<dyn Asset>, dependencies: Vec<AssetHandle>) {
        assert!(
            matches!(self.state, RecordState::Loading),
            "publish on a record that is not loading"
        );
        self.state = RecordState::Ready {
            payload,
            dependencies,
        };
    }

    /// Transitions `Ready` to `Unloading`, handing back the payload and the
    /// owned dependency handles. The returned sender completes the `done`
    /// future new acquires wait on.
    pub(crate) fn begin_unload(
        &mut self,
    ) -> (Arc<dyn Asset>, Vec<AssetHandle>, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let done = async move {
            let _ = rx.await;
        }
        .boxed()
        .shared();

        match std::mem::replace(&mut self.state, RecordState::Unloading { done }) {
            RecordState::Ready {
                payload,
                dependencies,
            } => (payload, dependencies, tx),
            _ => panic!("begin_unload on a record that is not ready"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{AssetRecord, RecordState};
    use crate::Asset;

    #[test]
    fn publish_then_unload_round_trip() {
        let mut record = AssetRecord::loading(7);
        assert!(!record.is_ready());

        record.publish(Arc::new(42_u32), vec![]);
        assert!(record.is_ready());

        record.refcount = 1;
        record.refcount -= 1;

        let (payload, dependencies, _tx) = record.begin_unload();
        assert_eq!(payload.as_ref().as_any().downcast_ref::<u32>(), Some(&42));
        assert!(dependencies.is_empty());
        assert!(matches!(record.state, RecordState::Unloading { .. }));
    }

    #[tokio::test]
    async fn unload_done_wakes_all_clones() {
        let mut record = AssetRecord::loading(1);
        record.publish(Arc::new(()), vec![]);
        let (_payload, _deps, tx) = record.begin_unload();

        let done = match &record.state {
            RecordState::Unloading { done } => done.clone(),
            _ => unreachable!(),
        };
        let other = done.clone();

        tx.send(()).unwrap();
        done.await;
        other.await;
    }
}
