use std::any::Any;

/// Types implementing `Asset` represent non-mutable runtime data.
///
/// Payloads are published by the cache as `Arc<dyn Asset>` and shared
/// read-only across all handle holders; strategies must not mutate an asset
/// after it has been published.
pub trait Asset: Any + Send + Sync {
    /// Cast to `&dyn Any` type.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> Asset for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}
