//! Reference-counted, dependency-aware asset cache.
//!
//! Many independent call sites request assets by string key; the cache hands
//! each of them one unit of ownership over a single shared in-memory payload,
//! loads transitive dependencies automatically, and folds concurrent requests
//! for a key already being loaded into one physical load.
//!
//! ## Lifecycle
//!
//! - [`AssetCache::acquire`] looks up or creates the per-key record. A
//!   resident payload bumps the refcount synchronously; a load in flight
//!   parks the caller on the waiter list; a miss kicks off the
//!   dependencies-then-self load pipeline.
//! - On success every waiter receives its own [`AssetHandle`]; on failure the
//!   record is evicted and every waiter receives the same error.
//! - [`AssetCache::release`] returns a unit of ownership. At refcount zero
//!   the record's own dependency handles are released and the owning
//!   [`LoadStrategy`] unloads the payload.
//!
//! Backends are [`LoadStrategy`] implementations registered by key prefix at
//! configuration time through [`AssetCacheOptions`]. Dependency handles are
//! always owned top-down (a record owns handles on its dependencies, never
//! the reverse) and a per-attempt resolution path turns dependency cycles
//! into [`AssetCacheError::DependencyCycle`] instead of deadlocks.

// crate-specific lint exceptions:
#![warn(missing_docs)]

mod inflight;
mod record;
mod resolver;

mod asset;
pub use asset::*;

mod cache;
pub use cache::*;

mod error;
pub use error::*;

mod handle;
pub use handle::*;

mod key;
pub use key::*;

mod prewarm;
pub use prewarm::*;

mod strategy;
pub use strategy::*;

mod telemetry;
pub use telemetry::*;
