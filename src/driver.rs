//! Storage driver contract
//!
//! A [`Driver`] stores values under a compound `(parent_id, resource_id)` key
//! and answers aggregate lookups in both directions: every resource under a
//! parent, and every parent containing a resource.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::HashMap, convert::Infallible, fmt, marker::PhantomData};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Identifies one cached association: a resource under a parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompoundKey {
    pub parent_id: String,
    pub resource_id: String,
}

impl CompoundKey {
    pub fn new(parent_id: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for CompoundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.parent_id, self.resource_id)
    }
}

/// Primitive storage operations used by [`ReverseCache`](crate::ReverseCache).
///
/// Aggregate lookups return `None` when nothing is known; implementations may
/// treat an empty set the same as an unknown parent or resource.
#[async_trait]
pub trait Driver<V: Cacheable>: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Total number of cached values
    async fn size(&self) -> Result<usize, Self::Error>;

    /// Number of resources known under `parent_id`
    async fn size_for_parent(&self, parent_id: &str) -> Result<usize, Self::Error>;

    /// Number of parents known to contain `resource_id`
    async fn size_for_resource(&self, resource_id: &str) -> Result<usize, Self::Error>;

    async fn get(&self, parent_id: &str, resource_id: &str) -> Result<Option<V>, Self::Error>;

    /// All resources under a parent, keyed by resource id
    async fn get_for_parent(
        &self,
        parent_id: &str,
    ) -> Result<Option<HashMap<String, V>>, Self::Error>;

    /// All parents containing a resource, keyed by parent id
    async fn get_for_resource(
        &self,
        resource_id: &str,
    ) -> Result<Option<HashMap<String, V>>, Self::Error>;

    async fn set(&self, parent_id: &str, resource_id: &str, value: &V) -> Result<(), Self::Error>;

    async fn delete(&self, parent_id: &str, resource_id: &str) -> Result<(), Self::Error>;

    /// Remove a parent and every association under it
    async fn parent_delete(&self, parent_id: &str) -> Result<(), Self::Error>;

    /// Remove a resource from every parent containing it
    async fn resource_delete(&self, resource_id: &str) -> Result<(), Self::Error>;

    /// Extend the lifetime of an entry on backends with expiry.
    async fn refresh_ttl(&self, _parent_id: &str, _resource_id: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Long-lived upkeep process (connection health and the like).
    ///
    /// Normally never returns. Failures are handled by the owning cache,
    /// which restarts it with backoff.
    async fn run(&self) -> Result<(), Self::Error> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Driver that stores nothing. Every lookup misses.
pub struct NoopDriver<V> {
    _value: PhantomData<fn() -> V>,
}

impl<V> NoopDriver<V> {
    pub fn new() -> Self {
        Self {
            _value: PhantomData,
        }
    }
}

impl<V> Default for NoopDriver<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V: Cacheable> Driver<V> for NoopDriver<V> {
    type Error = Infallible;

    async fn size(&self) -> Result<usize, Infallible> {
        Ok(0)
    }

    async fn size_for_parent(&self, _parent_id: &str) -> Result<usize, Infallible> {
        Ok(0)
    }

    async fn size_for_resource(&self, _resource_id: &str) -> Result<usize, Infallible> {
        Ok(0)
    }

    async fn get(&self, _parent_id: &str, _resource_id: &str) -> Result<Option<V>, Infallible> {
        Ok(None)
    }

    async fn get_for_parent(
        &self,
        _parent_id: &str,
    ) -> Result<Option<HashMap<String, V>>, Infallible> {
        Ok(None)
    }

    async fn get_for_resource(
        &self,
        _resource_id: &str,
    ) -> Result<Option<HashMap<String, V>>, Infallible> {
        Ok(None)
    }

    async fn set(
        &self,
        _parent_id: &str,
        _resource_id: &str,
        _value: &V,
    ) -> Result<(), Infallible> {
        Ok(())
    }

    async fn delete(&self, _parent_id: &str, _resource_id: &str) -> Result<(), Infallible> {
        Ok(())
    }

    async fn parent_delete(&self, _parent_id: &str) -> Result<(), Infallible> {
        Ok(())
    }

    async fn resource_delete(&self, _resource_id: &str) -> Result<(), Infallible> {
        Ok(())
    }

    async fn run(&self) -> Result<(), Infallible> {
        Ok(())
    }
}
