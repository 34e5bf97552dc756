//! Cache-aside orchestration with live sync
//!
//! [`ReverseCache`] composes a [`Driver`] with a [`ResourceSource`] that
//! resolves misses against the authoritative source, and an [`OpsSource`]
//! whose canonical ops are applied to the driver as they arrive.
//!
//! Two supervised background loops run for the lifetime of the cache:
//! - the ops consumer, which applies incoming ops to the driver
//! - the driver run-loop, which keeps [`Driver::run`] alive
//!
//! Both restart with [`RetryPolicy`] backoff on failure and are cancelled
//! when the last clone of the cache is dropped.

use async_trait::async_trait;
use futures::{StreamExt, future::try_join_all};
use std::{collections::HashMap, future::Future, marker::PhantomData, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    BoxError, CacheError, Cacheable, CompoundKey, Driver, NoOps, Op, OpsSource, RetryPolicy,
    supervisor::spawn_supervised,
};

/// Authoritative source consulted on cache misses.
#[async_trait]
pub trait ResourceSource<V>: Send + Sync + 'static {
    /// Ownership of a value. Fails if it cannot be determined.
    fn id(&self, value: &V) -> Result<CompoundKey, BoxError>;

    /// Fetch a single resource under a parent
    async fn on_miss(&self, parent_id: &str, resource_id: &str) -> Result<V, BoxError>;

    /// Fetch every resource under a parent, as `(resource_id, value)` pairs
    async fn on_parent_miss(&self, parent_id: &str) -> Result<Vec<(String, V)>, BoxError>;

    /// Fetch every parent containing a resource, as `(parent_id, value)` pairs
    async fn on_resource_miss(&self, resource_id: &str) -> Result<Vec<(String, V)>, BoxError>;
}

/// Apply one canonical op to a driver.
pub async fn apply_op<V, D>(driver: &D, op: Op<V>) -> Result<(), D::Error>
where
    V: Cacheable,
    D: Driver<V>,
{
    match op {
        Op::Create {
            parent_id,
            resource_id,
            resource,
        }
        | Op::Update {
            parent_id,
            resource_id,
            resource,
        } => driver.set(&parent_id, &resource_id, &resource).await,
        Op::Delete {
            parent_id,
            resource_id,
        } => driver.delete(&parent_id, &resource_id).await,
        Op::ParentDelete { parent_id } => driver.parent_delete(&parent_id).await,
        Op::ResourceDelete { resource_id } => driver.resource_delete(&resource_id).await,
    }
}

/// One subscription's worth of op consumption. Ends when the feed ends.
async fn consume_ops<V, D, O>(driver: Arc<D>, ops: Arc<O>) -> Result<(), BoxError>
where
    V: Cacheable,
    D: Driver<V>,
    O: OpsSource<V>,
{
    let mut feed = ops.subscribe();
    while let Some(op) = feed.next().await {
        let op = op?;
        log_op(&op);
        apply_op(driver.as_ref(), op).await?;
    }
    debug!("Ops feed completed");
    Ok(())
}

fn log_op<V>(op: &Op<V>) {
    match op {
        Op::Create {
            parent_id,
            resource_id,
            ..
        } => debug!(%parent_id, %resource_id, "Applying create op"),
        Op::Update {
            parent_id,
            resource_id,
            ..
        } => debug!(%parent_id, %resource_id, "Applying update op"),
        Op::Delete {
            parent_id,
            resource_id,
        } => debug!(%parent_id, %resource_id, "Applying delete op"),
        Op::ParentDelete { parent_id } => debug!(%parent_id, "Applying parentDelete op"),
        Op::ResourceDelete { resource_id } => debug!(%resource_id, "Applying resourceDelete op"),
    }
}

/// Cancels the background loops once the last cache clone is gone
struct Lifetime {
    shutdown: CancellationToken,
}

impl Drop for Lifetime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Reverse-lookup cache with miss resolution and live sync
pub struct ReverseCache<V, D, S> {
    driver: Arc<D>,
    source: Arc<S>,
    lifetime: Arc<Lifetime>,
    _value: PhantomData<fn() -> V>,
}

impl<V, D, S> Clone for ReverseCache<V, D, S> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            source: Arc::clone(&self.source),
            lifetime: Arc::clone(&self.lifetime),
            _value: PhantomData,
        }
    }
}

impl<V, D, S> ReverseCache<V, D, S>
where
    V: Cacheable,
    D: Driver<V>,
    S: ResourceSource<V>,
{
    /// Create a cache without an ops feed, using the default retry policy.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(driver: D, source: S) -> Self {
        Self::with_ops(driver, source, NoOps, RetryPolicy::default())
    }

    /// Create a cache kept in sync by `ops`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_ops<O>(driver: D, source: S, ops: O, retry: RetryPolicy) -> Self
    where
        O: OpsSource<V>,
    {
        let driver = Arc::new(driver);
        let ops = Arc::new(ops);
        let shutdown = CancellationToken::new();

        spawn_supervised("ops consumer", retry, shutdown.clone(), {
            let driver = Arc::clone(&driver);
            move || consume_ops::<V, D, O>(Arc::clone(&driver), Arc::clone(&ops))
        });

        spawn_supervised("driver run-loop", retry, shutdown.clone(), {
            let driver = Arc::clone(&driver);
            move || {
                let driver = Arc::clone(&driver);
                async move { driver.run().await.map_err(|e| Box::new(e) as BoxError) }
            }
        });

        Self {
            driver,
            source: Arc::new(source),
            lifetime: Arc::new(Lifetime { shutdown }),
            _value: PhantomData,
        }
    }

    /// The underlying driver, for lookups that must bypass miss resolution
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Stop both background loops. Foreground calls keep working.
    pub fn shutdown(&self) {
        self.lifetime.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lifetime.shutdown.is_cancelled()
    }

    /// Get a value, resolving and caching it on miss.
    pub async fn get(
        &self,
        parent_id: &str,
        resource_id: &str,
    ) -> Result<V, CacheError<D::Error>> {
        if let Some(value) = self
            .driver
            .get(parent_id, resource_id)
            .await
            .map_err(CacheError::Driver)?
        {
            debug!("Cache hit for key: {}:{}", parent_id, resource_id);
            return Ok(value);
        }

        debug!("Cache miss for key: {}:{}", parent_id, resource_id);
        let value = self
            .source
            .on_miss(parent_id, resource_id)
            .await
            .map_err(|source| {
                error!(
                    "Miss resolution failed for key {}:{}: {}",
                    parent_id, resource_id, source
                );
                CacheError::Miss {
                    parent_id: parent_id.to_owned(),
                    resource_id: resource_id.to_owned(),
                    source,
                }
            })?;

        self.driver
            .set(parent_id, resource_id, &value)
            .await
            .map_err(CacheError::Driver)?;
        Ok(value)
    }

    /// All resources under a parent, backfilling from the source on miss.
    pub async fn get_for_parent(
        &self,
        parent_id: &str,
    ) -> Result<HashMap<String, V>, CacheError<D::Error>> {
        if let Some(found) = self
            .driver
            .get_for_parent(parent_id)
            .await
            .map_err(CacheError::Driver)?
        {
            debug!("Cache hit for parent: {} ({} entries)", parent_id, found.len());
            return Ok(found);
        }

        debug!("Cache miss for parent: {}", parent_id);
        let entries = self
            .source
            .on_parent_miss(parent_id)
            .await
            .map_err(|source| CacheError::ParentMiss {
                parent_id: parent_id.to_owned(),
                source,
            })?;

        try_join_all(
            entries
                .iter()
                .map(|(resource_id, value)| self.driver.set(parent_id, resource_id, value)),
        )
        .await
        .map_err(CacheError::Driver)?;

        Ok(entries.into_iter().collect())
    }

    /// All parents containing a resource, backfilling from the source on miss.
    pub async fn get_for_resource(
        &self,
        resource_id: &str,
    ) -> Result<HashMap<String, V>, CacheError<D::Error>> {
        if let Some(found) = self
            .driver
            .get_for_resource(resource_id)
            .await
            .map_err(CacheError::Driver)?
        {
            debug!(
                "Cache hit for resource: {} ({} entries)",
                resource_id,
                found.len()
            );
            return Ok(found);
        }

        debug!("Cache miss for resource: {}", resource_id);
        let entries = self
            .source
            .on_resource_miss(resource_id)
            .await
            .map_err(|source| CacheError::ResourceMiss {
                resource_id: resource_id.to_owned(),
                source,
            })?;

        try_join_all(
            entries
                .iter()
                .map(|(parent_id, value)| self.driver.set(parent_id, resource_id, value)),
        )
        .await
        .map_err(CacheError::Driver)?;

        Ok(entries.into_iter().collect())
    }

    /// Store a value under the key its identity resolves to.
    pub async fn put(&self, value: &V) -> Result<CompoundKey, CacheError<D::Error>> {
        let key = self.source.id(value).map_err(CacheError::Identity)?;
        self.driver
            .set(&key.parent_id, &key.resource_id, value)
            .await
            .map_err(CacheError::Driver)?;
        Ok(key)
    }

    /// Read, transform and write back a value.
    ///
    /// There is no compare-and-swap: concurrent updates of the same key race
    /// and the last write wins. A failing transform aborts before any write.
    pub async fn update<F, Fut, E>(
        &self,
        parent_id: &str,
        resource_id: &str,
        f: F,
    ) -> Result<V, CacheError<D::Error>>
    where
        F: FnOnce(V) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<BoxError>,
    {
        let current = self.get(parent_id, resource_id).await?;
        let next = f(current)
            .await
            .map_err(|e| CacheError::Transform(e.into()))?;
        self.driver
            .set(parent_id, resource_id, &next)
            .await
            .map_err(CacheError::Driver)?;
        Ok(next)
    }

    pub async fn size(&self) -> Result<usize, CacheError<D::Error>> {
        self.driver.size().await.map_err(CacheError::Driver)
    }

    pub async fn size_for_parent(&self, parent_id: &str) -> Result<usize, CacheError<D::Error>> {
        self.driver
            .size_for_parent(parent_id)
            .await
            .map_err(CacheError::Driver)
    }

    pub async fn size_for_resource(
        &self,
        resource_id: &str,
    ) -> Result<usize, CacheError<D::Error>> {
        self.driver
            .size_for_resource(resource_id)
            .await
            .map_err(CacheError::Driver)
    }

    pub async fn delete(
        &self,
        parent_id: &str,
        resource_id: &str,
    ) -> Result<(), CacheError<D::Error>> {
        self.driver
            .delete(parent_id, resource_id)
            .await
            .map_err(CacheError::Driver)
    }

    pub async fn parent_delete(&self, parent_id: &str) -> Result<(), CacheError<D::Error>> {
        self.driver
            .parent_delete(parent_id)
            .await
            .map_err(CacheError::Driver)
    }

    pub async fn resource_delete(&self, resource_id: &str) -> Result<(), CacheError<D::Error>> {
        self.driver
            .resource_delete(resource_id)
            .await
            .map_err(CacheError::Driver)
    }

    pub async fn refresh_ttl(
        &self,
        parent_id: &str,
        resource_id: &str,
    ) -> Result<(), CacheError<D::Error>> {
        self.driver
            .refresh_ttl(parent_id, resource_id)
            .await
            .map_err(CacheError::Driver)
    }
}
