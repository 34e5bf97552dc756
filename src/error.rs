//! Cache error types

use redis::RedisError;

/// Opaque error returned by external collaborators (miss resolvers,
/// identity extractors, transforms, change producers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the key-value backends and [`IndexedStore`](crate::IndexedStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] BoxError),
}

/// Errors surfaced by [`ReverseCache`](crate::ReverseCache).
///
/// Each variant names the component that failed so callers can branch on
/// the origin. `E` is the error type of the underlying driver.
#[derive(Debug, thiserror::Error)]
pub enum CacheError<E> {
    #[error("Driver error: {0}")]
    Driver(#[source] E),

    #[error("Miss resolution failed for {parent_id}:{resource_id}: {source}")]
    Miss {
        parent_id: String,
        resource_id: String,
        source: BoxError,
    },

    #[error("Parent miss resolution failed for {parent_id}: {source}")]
    ParentMiss { parent_id: String, source: BoxError },

    #[error("Resource miss resolution failed for {resource_id}: {source}")]
    ResourceMiss { resource_id: String, source: BoxError },

    #[error("Could not determine identity of value: {0}")]
    Identity(#[source] BoxError),

    #[error("Update transform failed: {0}")]
    Transform(#[source] BoxError),
}

impl<E> CacheError<E> {
    /// True when the failure came from the driver rather than a resolver.
    pub fn is_driver(&self) -> bool {
        matches!(self, CacheError::Driver(_))
    }
}
