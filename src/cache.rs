use std::{
    collections::HashMap,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    task::{Context, Poll},
    time::{Duration, Instant, SystemTime},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    inflight::{InFlightLoadRegistry, LoadResult, WaiterId},
    record::{AssetRecord, RecordState, UnloadDone},
    resolver::{self, ResolutionPath},
    strategy::StrategyTable,
    Asset, AssetCacheError, AssetHandle, AssetKey, CacheEvent, CacheEventKind, LoadStrategy,
    TelemetrySink,
};

/// Progress callback for batch acquisition, invoked with
/// `(completed, total)` as members resolve. Borrowed callbacks are fine;
/// the callback only has to live as long as the batch call itself.
pub type ProgressFn<'a> = dyn Fn(usize, usize) + Send + Sync + 'a;

/// Options which can be used to configure the creation of [`AssetCache`].
///
/// Strategy registration is configuration-time only; the table is immutable
/// once the cache is created.
pub struct AssetCacheOptions {
    strategies: Vec<(String, Arc<dyn LoadStrategy>)>,
    max_dependency_depth: usize,
    prewarm_batch_size: usize,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl AssetCacheOptions {
    /// Creates a blank set of options for [`AssetCache`] configuration.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            max_dependency_depth: 64,
            prewarm_batch_size: 16,
            telemetry: None,
        }
    }

    /// Registers a load strategy for every key starting with `prefix`.
    ///
    /// First matching registration wins; an empty prefix acts as a
    /// catch-all and should come last.
    #[must_use]
    pub fn add_strategy(
        mut self,
        prefix: impl Into<String>,
        strategy: Arc<dyn LoadStrategy>,
    ) -> Self {
        self.strategies.push((prefix.into(), strategy));
        self
    }

    /// Bounds the dependency resolution chain; longer chains (or cycles)
    /// fail with [`AssetCacheError::DependencyCycle`].
    #[must_use]
    pub fn with_max_dependency_depth(mut self, depth: usize) -> Self {
        self.max_dependency_depth = depth;
        self
    }

    /// Number of keys [`AssetCache::prewarm`] acquires between yield points.
    #[must_use]
    pub fn with_prewarm_batch_size(mut self, batch_size: usize) -> Self {
        self.prewarm_batch_size = batch_size.max(1);
        self
    }

    /// Injects a sink for lifecycle events.
    #[must_use]
    pub fn with_telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Creates an [`AssetCache`] based on the options.
    pub fn create(self) -> Arc<AssetCache> {
        Arc::new_cyclic(|this| AssetCache {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                inflight: InFlightLoadRegistry::default(),
            }),
            strategies: StrategyTable::new(self.strategies),
            max_dependency_depth: self.max_dependency_depth,
            prewarm_batch_size: self.prewarm_batch_size,
            telemetry: self.telemetry,
            generation: AtomicU64::new(1),
            this: Weak::clone(this),
        })
    }
}

struct Inner {
    records: HashMap<AssetKey, AssetRecord>,
    inflight: InFlightLoadRegistry,
}

/// Reference-counted, dependency-aware cache of loaded assets.
///
/// Many independent call sites may request the same key; they share one
/// in-memory payload, and concurrent requests for a key already being
/// loaded are folded into a single physical load. Each successful
/// [`acquire`] hands out one unit of ownership which must be returned
/// through [`release`]; at refcount zero the payload and the record's own
/// dependency handles are released.
///
/// The record table is the only shared mutable state, guarded by a single
/// mutex with short critical sections; no lock is held across await points.
///
/// [`acquire`]: Self::acquire
/// [`release`]: Self::release
pub struct AssetCache {
    inner: Mutex<Inner>,
    strategies: StrategyTable,
    max_dependency_depth: usize,
    pub(crate) prewarm_batch_size: usize,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    generation: AtomicU64,
    /// Back-reference for handing owned clones to spawned load/unload tasks.
    this: Weak<AssetCache>,
}

enum AcquirePlan {
    Ready(AssetHandle),
    Wait(WaiterId, oneshot::Receiver<LoadResult>),
    AwaitUnload(UnloadDone),
    Start(WaiterId, oneshot::Receiver<LoadResult>, CancellationToken),
}

impl AssetCache {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn arc_self(&self) -> Arc<Self> {
        self.this.upgrade().expect("cache owner dropped")
    }

    /// Loads the asset identified by `key`, or joins the load already in
    /// flight for it, and returns an owning handle.
    ///
    /// If the record is already resident the refcount is incremented
    /// synchronously. Dependencies declared by the backend are acquired
    /// first, recursively, through this same entry point.
    ///
    /// # Errors
    /// Returns `AssetCacheError` on failure; a failed record is evicted, so
    /// a later acquire retries from scratch.
    pub async fn acquire(
        &self,
        key: impl Into<AssetKey>,
    ) -> Result<AssetHandle, AssetCacheError> {
        self.acquire_with_path(key.into(), ResolutionPath::root())
            .await
    }

    /// Like [`Self::acquire`], but verifies the payload type.
    ///
    /// # Errors
    /// Returns `TypeMismatch` (and releases the unit of ownership it just
    /// acquired) if the payload is not a `T`.
    pub async fn acquire_as<T: Asset>(
        &self,
        key: impl Into<AssetKey>,
    ) -> Result<AssetHandle, AssetCacheError> {
        let key = key.into();
        let mut handle = self.acquire(key.clone()).await?;
        if handle.downcast_ref::<T>().is_none() {
            if let Err(err) = self.release(&mut handle) {
                warn!("failed to release mistyped handle for '{}': {}", key, err);
            }
            return Err(AssetCacheError::TypeMismatch {
                key,
                expected: std::any::type_name::<T>(),
            });
        }
        Ok(handle)
    }

    /// Acquires every key of `keys` in parallel.
    ///
    /// `progress` is invoked with `(completed, total)` as members resolve;
    /// a panicking callback is caught and logged, never propagated into the
    /// batch. On failure every member handle acquired so far is released
    /// before the error surfaces, so a partial batch never leaks.
    ///
    /// # Errors
    /// Returns `BatchFailed` carrying the first member failure and a count
    /// of the other members that failed.
    pub async fn acquire_batch(
        &self,
        keys: &[AssetKey],
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<Vec<AssetHandle>, AssetCacheError> {
        let total = keys.len();
        let completed = AtomicUsize::new(0);

        let results = futures::future::join_all(keys.iter().map(|key| {
            let completed = &completed;
            async move {
                let result = self.acquire(key.clone()).await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(callback) = progress {
                    if catch_unwind(AssertUnwindSafe(|| callback(done, total))).is_err() {
                        warn!("progress callback panicked ({}/{})", done, total);
                    }
                }
                result
            }
        }))
        .await;

        let mut handles = Vec::with_capacity(total);
        let mut first = None;
        let mut additional = 0;
        for result in results {
            match result {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    if first.is_none() {
                        first = Some(err);
                    } else {
                        additional += 1;
                    }
                }
            }
        }

        match first {
            None => Ok(handles),
            Some(first) => {
                resolver::rollback(self, handles);
                Err(AssetCacheError::BatchFailed {
                    first: Box::new(first),
                    additional,
                })
            }
        }
    }

    /// Returns one unit of ownership for `key`.
    ///
    /// Decrements the record's refcount; at zero the record's own dependency
    /// handles are released and the strategy unload is scheduled. Never
    /// suspends; while the asynchronous unload runs, new acquires for the
    /// key wait for it to finish.
    ///
    /// # Errors
    /// Returns `DoubleRelease` if the handle was already released, or if it
    /// is stale for an earlier incarnation of the key. The error never
    /// corrupts the refcount of a live incarnation.
    pub fn release(&self, handle: &mut AssetHandle) -> Result<(), AssetCacheError> {
        if handle.is_released() {
            error!("double release of handle for '{}'", handle.key());
            return Err(AssetCacheError::DoubleRelease(handle.key().clone()));
        }
        handle.mark_released();

        let key = handle.key().clone();
        let generation = handle.generation();
        let mut inner = self.lock_inner();
        let result = self.release_locked(&mut inner, &key, generation);
        drop(inner);
        if let Err(err) = &result {
            error!("release of '{}' rejected: {}", key, err);
        }
        result
    }

    /// Releases every handle of `handles`, continuing past individual
    /// failures.
    ///
    /// # Errors
    /// Returns `BatchFailed` aggregating the first failure and a count of
    /// the others.
    pub fn release_batch(
        &self,
        handles: &mut [AssetHandle],
    ) -> Result<(), AssetCacheError> {
        let mut first = None;
        let mut additional = 0;
        for handle in handles {
            if let Err(err) = self.release(handle) {
                if first.is_none() {
                    first = Some(err);
                } else {
                    additional += 1;
                }
            }
        }
        match first {
            None => Ok(()),
            Some(first) => Err(AssetCacheError::BatchFailed {
                first: Box::new(first),
                additional,
            }),
        }
    }

    /// Returns a handle for `key` iff its payload is already resident;
    /// never triggers a load.
    pub fn lookup(&self, key: &AssetKey) -> Option<AssetHandle> {
        let mut inner = self.lock_inner();
        let record = inner.records.get_mut(key)?;
        if let RecordState::Ready { payload, .. } = &record.state {
            let payload = Arc::clone(payload);
            record.refcount += 1;
            return Some(AssetHandle::new(key.clone(), record.generation, payload));
        }
        None
    }

    /// Returns true if the payload for `key` is resident.
    pub fn is_ready(&self, key: &AssetKey) -> bool {
        self.lock_inner()
            .records
            .get(key)
            .map_or(false, AssetRecord::is_ready)
    }

    pub(crate) fn acquire_with_path(
        &self,
        key: AssetKey,
        path: ResolutionPath,
    ) -> impl Future<Output = Result<AssetHandle, AssetCacheError>> + Send + 'static {
        let cache = self.arc_self();
        async move {
            let attempt_path = path.push(&key, cache.max_dependency_depth)?;

            loop {
                let plan = {
                    let mut inner = cache.lock_inner();
                    match inner.records.get_mut(&key) {
                        Some(record) => match &record.state {
                            RecordState::Ready { payload, .. } => {
                                let payload = Arc::clone(payload);
                                record.refcount += 1;
                                AcquirePlan::Ready(AssetHandle::new(
                                    key.clone(),
                                    record.generation,
                                    payload,
                                ))
                            }
                            RecordState::Loading => {
                                let (id, rx) = inner
                                    .inflight
                                    .register_waiter(&key)
                                    .expect("loading record without in-flight entry");
                                AcquirePlan::Wait(id, rx)
                            }
                            RecordState::Unloading { done } => {
                                AcquirePlan::AwaitUnload(done.clone())
                            }
                        },
                        None => {
                            let generation = cache.generation.fetch_add(1, Ordering::Relaxed);
                            inner
                                .records
                                .insert(key.clone(), AssetRecord::loading(generation));
                            let cancel = inner.inflight.begin(key.clone());
                            let (id, rx) = inner
                                .inflight
                                .register_waiter(&key)
                                .expect("in-flight entry just created");
                            AcquirePlan::Start(id, rx, cancel)
                        }
                    }
                };

                match plan {
                    AcquirePlan::Ready(handle) => return Ok(handle),
                    AcquirePlan::AwaitUnload(done) => {
                        // unload finished -> record gone -> fresh load
                        done.await;
                    }
                    AcquirePlan::Wait(id, rx) => {
                        return LoadWaiter::new(&cache, key, id, rx).await;
                    }
                    AcquirePlan::Start(id, rx, cancel) => {
                        tokio::spawn(cache.load_pipeline(
                            key.clone(),
                            attempt_path.clone(),
                            cancel,
                        ));
                        return LoadWaiter::new(&cache, key, id, rx).await;
                    }
                }
            }
        }
    }

    /// The spawned per-key physical load: declare dependencies, acquire
    /// them, fetch the payload, publish. Boxed so dependency acquisition
    /// can recurse through [`Self::acquire_with_path`].
    fn load_pipeline(
        &self,
        key: AssetKey,
        path: ResolutionPath,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        let cache = self.arc_self();
        async move {
            let started = Instant::now();
            cache.emit(&key, CacheEventKind::Started, None);

            let result = cache.run_load(&key, &path, &cancel).await;
            cache.finish_load(&key, started, result);
        }
        .boxed()
    }

    async fn run_load(
        &self,
        key: &AssetKey,
        path: &ResolutionPath,
        cancel: &CancellationToken,
    ) -> Result<(Arc<dyn Asset>, Vec<AssetHandle>), AssetCacheError> {
        let strategy = self
            .strategies
            .resolve(key)
            .ok_or_else(|| AssetCacheError::NoStrategy(key.clone()))?;

        let declared = tokio::select! {
            _ = cancel.cancelled() => return Err(AssetCacheError::Cancelled(key.clone())),
            declared = strategy.declare_dependencies(key, cancel) => declared?,
        };

        let dependencies = resolver::acquire_all(self, key, &declared, path, cancel).await?;

        let payload = tokio::select! {
            _ = cancel.cancelled() => {
                resolver::rollback(self, dependencies);
                return Err(AssetCacheError::Cancelled(key.clone()));
            }
            payload = strategy.load(key, cancel) => match payload {
                Ok(payload) => payload,
                Err(err) => {
                    // self load failed after its dependencies were acquired
                    resolver::rollback(self, dependencies);
                    return Err(err);
                }
            },
        };

        Ok((payload, dependencies))
    }

    fn finish_load(
        &self,
        key: &AssetKey,
        started: Instant,
        result: Result<(Arc<dyn Asset>, Vec<AssetHandle>), AssetCacheError>,
    ) {
        match result {
            Ok((payload, dependencies)) => {
                let mut inner = self.lock_inner();
                let entry = inner
                    .inflight
                    .complete(key)
                    .expect("resolved load without in-flight entry");

                let record = inner
                    .records
                    .get_mut(key)
                    .expect("resolved load without record");
                let generation = record.generation;
                record.publish(Arc::clone(&payload), dependencies);

                let delivered = entry.complete_with(|| {
                    Ok(AssetHandle::new(
                        key.clone(),
                        generation,
                        Arc::clone(&payload),
                    ))
                });
                let record = inner
                    .records
                    .get_mut(key)
                    .expect("record vanished during publish");
                record.refcount = delivered as u32;

                if delivered == 0 {
                    // every waiter cancelled after the physical load was past
                    // the point of no return; nobody owns the payload
                    debug!("'{}' resolved with no remaining waiters", key);
                    self.begin_unload_locked(&mut inner, key);
                }
                drop(inner);

                info!("loaded '{}' in {:?}", key, started.elapsed());
                self.emit(key, CacheEventKind::Resolved, Some(started.elapsed()));
            }
            Err(err) => {
                let mut inner = self.lock_inner();
                let entry = inner
                    .inflight
                    .complete(key)
                    .expect("failed load without in-flight entry");
                // evict immediately so a later acquire retries fresh
                inner.records.remove(key);
                entry.complete_with(|| Err(err.clone()));
                drop(inner);

                error!("load of '{}' failed: {}", key, err);
                self.emit(key, CacheEventKind::Failed, Some(started.elapsed()));
            }
        }
    }

    /// Decrements the refcount of `key` for a handle of `generation`; at
    /// zero, begins the unload.
    fn release_locked(
        &self,
        inner: &mut Inner,
        key: &AssetKey,
        generation: u64,
    ) -> Result<(), AssetCacheError> {
        if self.decrement_locked(inner, key, generation)? {
            self.begin_unload_locked(inner, key);
        }
        Ok(())
    }

    /// Returns true if the refcount hit zero.
    fn decrement_locked(
        &self,
        inner: &mut Inner,
        key: &AssetKey,
        generation: u64,
    ) -> Result<bool, AssetCacheError> {
        let Some(record) = inner.records.get_mut(key) else {
            return Err(AssetCacheError::DoubleRelease(key.clone()));
        };
        if record.generation != generation || !record.is_ready() || record.refcount == 0 {
            return Err(AssetCacheError::DoubleRelease(key.clone()));
        }
        record.refcount -= 1;
        Ok(record.refcount == 0)
    }

    /// Takes a refcount-zero record out of `Ready`, returns its dependency
    /// handles to the cache, and schedules the strategy unload. The record
    /// stays resident in `Unloading` state until the unload task removes it,
    /// which keeps a new load of the key from racing the unload.
    ///
    /// Dependency chains are walked with an explicit worklist so a deep
    /// chain does not grow the stack under the table lock.
    fn begin_unload_locked(&self, inner: &mut Inner, key: &AssetKey) {
        let mut pending = vec![key.clone()];
        while let Some(key) = pending.pop() {
            let record = inner
                .records
                .get_mut(&key)
                .expect("unload of an absent record");
            let (payload, dependencies, done_tx) = record.begin_unload();

            for mut dependency in dependencies.into_iter().rev() {
                dependency.mark_released();
                let dep_key = dependency.key().clone();
                match self.decrement_locked(inner, &dep_key, dependency.generation()) {
                    Ok(true) => pending.push(dep_key),
                    Ok(false) => {}
                    Err(err) => {
                        error!("dependency bookkeeping out of sync for '{}': {}", dep_key, err);
                    }
                }
            }

            let cache = self.arc_self();
            tokio::spawn(async move {
                let started = Instant::now();
                if let Some(strategy) = cache.strategies.resolve(&key) {
                    strategy.unload(&key, payload).await;
                }
                cache.lock_inner().records.remove(&key);
                let _ = done_tx.send(());

                debug!("unloaded '{}'", key);
                cache.emit(&key, CacheEventKind::Released, Some(started.elapsed()));
            });
        }
    }

    fn emit(&self, key: &AssetKey, kind: CacheEventKind, duration: Option<Duration>) {
        if let Some(sink) = &self.telemetry {
            let event = CacheEvent {
                key: key.clone(),
                kind,
                timestamp: SystemTime::now(),
                duration,
            };
            if catch_unwind(AssertUnwindSafe(|| sink.record(event))).is_err() {
                warn!("telemetry sink panicked; event for '{}' dropped", key);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn refcount_of(&self, key: &AssetKey) -> Option<u32> {
        self.lock_inner().records.get(key).map(|record| record.refcount)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &AssetKey) -> bool {
        self.lock_inner().records.contains_key(key)
    }

    #[cfg(test)]
    pub(crate) fn inflight_waiters(&self, key: &AssetKey) -> usize {
        self.lock_inner().inflight.waiter_count(key)
    }
}

/// A parked acquire waiting for the physical load of its key.
///
/// Dropping the waiter before delivery removes it from the waiter list
/// without affecting the load or the other waiters; the registry cancels
/// the physical load when the last waiter leaves. If the load resolved
/// while the waiter was being dropped, the handle sitting unclaimed in the
/// channel is returned to the cache so its refcount unit is not leaked.
struct LoadWaiter {
    cache: Arc<AssetCache>,
    key: AssetKey,
    waiter_id: WaiterId,
    rx: Option<oneshot::Receiver<LoadResult>>,
    delivered: bool,
}

impl LoadWaiter {
    fn new(
        cache: &Arc<AssetCache>,
        key: AssetKey,
        waiter_id: WaiterId,
        rx: oneshot::Receiver<LoadResult>,
    ) -> Self {
        Self {
            cache: Arc::clone(cache),
            key,
            waiter_id,
            rx: Some(rx),
            delivered: false,
        }
    }
}

impl Future for LoadWaiter {
    type Output = Result<AssetHandle, AssetCacheError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let rx = self.rx.as_mut().expect("waiter polled after completion");
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                self.delivered = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                // load task dropped its side without resolving
                self.delivered = true;
                Poll::Ready(Err(AssetCacheError::Cancelled(self.key.clone())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for LoadWaiter {
    fn drop(&mut self) {
        if self.delivered {
            return;
        }
        let mut inner = self.cache.lock_inner();
        if inner.inflight.remove_waiter(&self.key, self.waiter_id) {
            // still loading; the registry cancelled the load if this was
            // the last waiter
            return;
        }
        if let Some(mut rx) = self.rx.take() {
            if let Ok(Ok(mut handle)) = rx.try_recv() {
                handle.mark_released();
                let generation = handle.generation();
                if let Err(err) = self.cache.release_locked(&mut inner, &self.key, generation) {
                    error!(
                        "failed to reclaim handle for cancelled waiter on '{}': {}",
                        self.key, err
                    );
                }
            }
        }
    }
}
