use std::time::{Duration, SystemTime};

use crate::AssetKey;

/// Kind of lifecycle event emitted by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    /// A physical load for the key was started.
    Started,
    /// The load resolved and the payload was published.
    Resolved,
    /// The load failed or was cancelled.
    Failed,
    /// The payload was unloaded after its refcount reached zero.
    Released,
}

/// A structured notification sent to the telemetry sink.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Key the event refers to.
    pub key: AssetKey,
    /// What happened.
    pub kind: CacheEventKind,
    /// When it happened.
    pub timestamp: SystemTime,
    /// How long the load or unload took, when applicable.
    pub duration: Option<Duration>,
}

/// Receives cache lifecycle events, fire-and-forget.
///
/// Sink failures never affect cache correctness: a panicking sink is caught
/// and logged, and the event is dropped.
pub trait TelemetrySink: Send + Sync {
    /// Records a single event.
    fn record(&self, event: CacheEvent);
}
