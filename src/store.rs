//! Dual-indexed storage driver
//!
//! [`IndexedStore`] keeps three logical namespaces over any [`KeyValueStore`]:
//! - values: `{value_prefix}{parent_id}:{resource_id}` -> JSON encoded value
//! - forward index: `{forward_prefix}{parent_id}` -> JSON list of resource ids
//! - reverse index: `{reverse_prefix}{resource_id}` -> JSON list of parent ids
//!
//! The backend only offers per-key atomicity, so a value write and its two
//! index writes are independent. Index writes are best effort: failures are
//! logged and never fail the call. Drift between values and indices is
//! repaired lazily when an aggregate read finds index entries whose value is
//! gone.
//!
//! Index entries are read-modify-write lists, so every mutation of one index
//! key is serialized through a per-key lock shared by all clones of the store.
//! The lock is process-local.

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use std::{
    collections::{HashMap, HashSet},
    marker::PhantomData,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::{Cacheable, Driver, KeyValueStore, StoreConfig, StoreError};

type IndexLocks = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

pub struct IndexedStore<V, B> {
    backend: Arc<B>,
    config: StoreConfig,
    index_locks: IndexLocks,
    _value: PhantomData<fn() -> V>,
}

impl<V, B> Clone for IndexedStore<V, B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
            index_locks: Arc::clone(&self.index_locks),
            _value: PhantomData,
        }
    }
}

/// Exclusive hold on one index key. Unused lock entries are removed on drop.
struct IndexGuard {
    key: String,
    locks: IndexLocks,
    lock: Arc<AsyncMutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for IndexGuard {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and this guard are the only owners left
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

/// Which index an aggregate operation walks
#[derive(Debug, Clone, Copy)]
enum Direction {
    /// parent -> resources
    Forward,
    /// resource -> parents
    Reverse,
}

impl<V, B> IndexedStore<V, B>
where
    V: Cacheable,
    B: KeyValueStore,
{
    pub fn new(backend: B, config: StoreConfig) -> Self {
        Self::from_shared(Arc::new(backend), config)
    }

    /// Build a store over a backend that is shared with other code
    pub fn from_shared(backend: Arc<B>, config: StoreConfig) -> Self {
        Self {
            backend,
            config,
            index_locks: Arc::default(),
            _value: PhantomData,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn value_key(&self, parent_id: &str, resource_id: &str) -> String {
        format!("{}{}:{}", self.config.value_prefix, parent_id, resource_id)
    }

    pub fn forward_key(&self, parent_id: &str) -> String {
        format!("{}{}", self.config.forward_prefix, parent_id)
    }

    pub fn reverse_key(&self, resource_id: &str) -> String {
        format!("{}{}", self.config.reverse_prefix, resource_id)
    }

    fn index_key(&self, direction: Direction, id: &str) -> String {
        match direction {
            Direction::Forward => self.forward_key(id),
            Direction::Reverse => self.reverse_key(id),
        }
    }

    /// Compound value key for `id` (the indexed side) and `other` (a member).
    fn member_value_key(&self, direction: Direction, id: &str, other: &str) -> String {
        match direction {
            Direction::Forward => self.value_key(id, other),
            Direction::Reverse => self.value_key(other, id),
        }
    }

    /// Read an index entry. A missing entry is an empty set.
    async fn read_index(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.backend.get(key).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Replace an index entry. An empty set removes the key.
    async fn write_index(&self, key: &str, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            self.backend.delete(key).await
        } else {
            self.backend.set(key, serde_json::to_string(ids)?).await
        }
    }

    async fn lock_index(&self, key: &str) -> IndexGuard {
        let lock = {
            let mut locks = self.index_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_owned()).or_default())
        };
        let held = Arc::clone(&lock).lock_owned().await;
        IndexGuard {
            key: key.to_owned(),
            locks: Arc::clone(&self.index_locks),
            lock,
            held: Some(held),
        }
    }

    /// Read, edit and write back an index entry while holding its lock.
    /// Nothing is written if the edit leaves the entry unchanged.
    async fn edit_index<F>(&self, key: &str, edit: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Vec<String>) + Send,
    {
        let _guard = self.lock_index(key).await;
        let mut ids = self.read_index(key).await?;
        let before = ids.clone();
        edit(&mut ids);
        if ids == before {
            return Ok(());
        }
        self.write_index(key, &ids).await
    }

    async fn add_to_index(&self, key: &str, id: &str) -> Result<(), StoreError> {
        self.edit_index(key, |ids| {
            if !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_owned());
            }
        })
        .await
    }

    async fn remove_from_index(&self, key: &str, id: &str) -> Result<(), StoreError> {
        self.edit_index(key, |ids| ids.retain(|existing| existing != id))
            .await
    }

    /// Log and swallow a failed index write
    fn best_effort(result: Result<(), StoreError>, action: &str, key: &str) {
        if let Err(e) = result {
            warn!("IndexedStore: failed to {} index {}: {}", action, key, e);
        }
    }

    async fn read_value(&self, key: &str) -> Result<Option<V>, StoreError> {
        let Some(json) = self.backend.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<V>(&json) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(
                    "IndexedStore: failed to deserialize value at {}: {}. Deleting corrupt entry.",
                    key, e
                );
                if let Err(del_err) = self.backend.delete(key).await {
                    warn!(
                        "IndexedStore: failed to delete corrupt entry {}: {}",
                        key, del_err
                    );
                }
                Ok(None)
            }
        }
    }

    /// Fetch every value referenced by an index entry, pruning ids whose
    /// value no longer exists.
    async fn collect(
        &self,
        direction: Direction,
        id: &str,
    ) -> Result<Option<HashMap<String, V>>, StoreError> {
        let index_key = self.index_key(direction, id);
        let ids = self.read_index(&index_key).await?;
        if ids.is_empty() {
            return Ok(None);
        }

        let fetched = try_join_all(ids.iter().map(|other| {
            let key = self.member_value_key(direction, id, other);
            async move { self.read_value(&key).await }
        }))
        .await?;

        let mut found = HashMap::with_capacity(ids.len());
        let mut stale = HashSet::new();
        let mut duplicated = false;
        for (other, value) in ids.iter().zip(fetched) {
            match value {
                Some(_) if found.contains_key(other) => duplicated = true,
                Some(value) => {
                    found.insert(other.clone(), value);
                }
                None => {
                    stale.insert(other.clone());
                }
            }
        }

        if !stale.is_empty() || duplicated {
            debug!(
                "IndexedStore: pruning {} stale entries from index {}",
                stale.len(),
                index_key
            );
            // Re-read under the lock so ids added meanwhile survive the rewrite
            let result = self
                .edit_index(&index_key, |current| {
                    let mut seen = HashSet::new();
                    current.retain(|other| !stale.contains(other) && seen.insert(other.clone()));
                })
                .await;
            Self::best_effort(result, "rewrite", &index_key);
        }

        if found.is_empty() {
            Ok(None)
        } else {
            Ok(Some(found))
        }
    }

    /// Drop an index entry and every association it references.
    async fn cascade_delete(&self, direction: Direction, id: &str) -> Result<(), StoreError> {
        let index_key = self.index_key(direction, id);
        let ids = {
            let _guard = self.lock_index(&index_key).await;
            let ids = self.read_index(&index_key).await?;
            Self::best_effort(self.backend.delete(&index_key).await, "clear", &index_key);
            ids
        };

        if ids.is_empty() {
            return Ok(());
        }
        debug!(
            "IndexedStore: cascading delete of {} ({} entries)",
            index_key,
            ids.len()
        );

        let opposite = match direction {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        };
        join_all(ids.iter().map(|other| {
            let key = self.index_key(opposite, other);
            async move {
                let result = self.remove_from_index(&key, id).await;
                Self::best_effort(result, "update", &key);
            }
        }))
        .await;

        try_join_all(ids.iter().map(|other| {
            let key = self.member_value_key(direction, id, other);
            async move { self.backend.delete(&key).await }
        }))
        .await?;

        Ok(())
    }
}

#[async_trait]
impl<V, B> Driver<V> for IndexedStore<V, B>
where
    V: Cacheable,
    B: KeyValueStore,
{
    type Error = StoreError;

    async fn size(&self) -> Result<usize, StoreError> {
        self.backend.count(&self.config.value_prefix).await
    }

    async fn size_for_parent(&self, parent_id: &str) -> Result<usize, StoreError> {
        Ok(self.read_index(&self.forward_key(parent_id)).await?.len())
    }

    async fn size_for_resource(&self, resource_id: &str) -> Result<usize, StoreError> {
        Ok(self.read_index(&self.reverse_key(resource_id)).await?.len())
    }

    async fn get(&self, parent_id: &str, resource_id: &str) -> Result<Option<V>, StoreError> {
        self.read_value(&self.value_key(parent_id, resource_id))
            .await
    }

    async fn get_for_parent(
        &self,
        parent_id: &str,
    ) -> Result<Option<HashMap<String, V>>, StoreError> {
        self.collect(Direction::Forward, parent_id).await
    }

    async fn get_for_resource(
        &self,
        resource_id: &str,
    ) -> Result<Option<HashMap<String, V>>, StoreError> {
        self.collect(Direction::Reverse, resource_id).await
    }

    async fn set(&self, parent_id: &str, resource_id: &str, value: &V) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;
        self.backend
            .set(&self.value_key(parent_id, resource_id), json)
            .await?;

        let forward = self.forward_key(parent_id);
        Self::best_effort(
            self.add_to_index(&forward, resource_id).await,
            "update",
            &forward,
        );
        let reverse = self.reverse_key(resource_id);
        Self::best_effort(
            self.add_to_index(&reverse, parent_id).await,
            "update",
            &reverse,
        );
        Ok(())
    }

    async fn delete(&self, parent_id: &str, resource_id: &str) -> Result<(), StoreError> {
        self.backend
            .delete(&self.value_key(parent_id, resource_id))
            .await?;

        let forward = self.forward_key(parent_id);
        Self::best_effort(
            self.remove_from_index(&forward, resource_id).await,
            "update",
            &forward,
        );
        let reverse = self.reverse_key(resource_id);
        Self::best_effort(
            self.remove_from_index(&reverse, parent_id).await,
            "update",
            &reverse,
        );
        Ok(())
    }

    async fn parent_delete(&self, parent_id: &str) -> Result<(), StoreError> {
        self.cascade_delete(Direction::Forward, parent_id).await
    }

    async fn resource_delete(&self, resource_id: &str) -> Result<(), StoreError> {
        self.cascade_delete(Direction::Reverse, resource_id).await
    }

    async fn refresh_ttl(&self, parent_id: &str, resource_id: &str) -> Result<(), StoreError> {
        self.backend
            .touch(&self.value_key(parent_id, resource_id))
            .await?;

        let forward = self.forward_key(parent_id);
        Self::best_effort(self.backend.touch(&forward).await, "touch", &forward);
        let reverse = self.reverse_key(resource_id);
        Self::best_effort(self.backend.touch(&reverse).await, "touch", &reverse);
        Ok(())
    }

    async fn run(&self) -> Result<(), StoreError> {
        self.backend.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoxError, MemoryBackend};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Channel {
        name: String,
    }

    fn channel(name: &str) -> Channel {
        Channel {
            name: name.to_owned(),
        }
    }

    fn store() -> IndexedStore<Channel, MemoryBackend> {
        IndexedStore::new(MemoryBackend::new(), StoreConfig::default())
    }

    async fn raw_index<V: Cacheable, B: KeyValueStore>(
        store: &IndexedStore<V, B>,
        key: &str,
    ) -> Vec<String> {
        store.read_index(key).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_writes_value_and_both_indices() {
        let store = store();
        store.set("g1", "c1", &channel("general")).await.unwrap();

        assert!(store.backend().get("value:g1:c1").await.unwrap().is_some());
        assert_eq!(raw_index(&store, "mapping:g1").await, vec!["c1"]);
        assert_eq!(raw_index(&store, "reverse:c1").await, vec!["g1"]);

        // Re-setting does not duplicate index entries
        store.set("g1", "c1", &channel("renamed")).await.unwrap();
        assert_eq!(raw_index(&store, "mapping:g1").await, vec!["c1"]);
        assert_eq!(raw_index(&store, "reverse:c1").await, vec!["g1"]);
        assert_eq!(
            store.get("g1", "c1").await.unwrap(),
            Some(channel("renamed"))
        );
    }

    #[tokio::test]
    async fn test_aggregate_reads_both_directions() {
        let store = store();
        store.set("g1", "c1", &channel("a")).await.unwrap();
        store.set("g1", "c2", &channel("b")).await.unwrap();
        store.set("g2", "c1", &channel("c")).await.unwrap();

        let by_parent = store.get_for_parent("g1").await.unwrap().unwrap();
        assert_eq!(by_parent.len(), 2);
        assert_eq!(by_parent["c2"], channel("b"));

        let by_resource = store.get_for_resource("c1").await.unwrap().unwrap();
        assert_eq!(by_resource.len(), 2);
        assert_eq!(by_resource["g2"], channel("c"));

        assert_eq!(store.size().await.unwrap(), 3);
        assert_eq!(store.size_for_parent("g1").await.unwrap(), 2);
        assert_eq!(store.size_for_resource("c1").await.unwrap(), 2);
        assert_eq!(store.size_for_parent("unknown").await.unwrap(), 0);
        assert!(store.get_for_parent("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_for_parent_prunes_stale_entries() {
        let store = store();
        for id in ["c1", "c2", "c3"] {
            store.set("g1", id, &channel(id)).await.unwrap();
        }
        store.backend().delete("value:g1:c3").await.unwrap();

        let found = store.get_for_parent("g1").await.unwrap().unwrap();
        let mut ids: Vec<_> = found.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(raw_index(&store, "mapping:g1").await, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_get_for_resource_prunes_to_unknown() {
        let store = store();
        store.set("g1", "c1", &channel("a")).await.unwrap();
        store.backend().delete("value:g1:c1").await.unwrap();

        assert!(store.get_for_resource("c1").await.unwrap().is_none());
        // Fully stale index entry is removed entirely
        assert!(store.backend().get("reverse:c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = store();
        store.set("g1", "c1", &channel("a")).await.unwrap();
        store.delete("g1", "c1").await.unwrap();
        store.delete("g1", "c1").await.unwrap();
        store.delete("nope", "nada").await.unwrap();

        assert_eq!(store.size().await.unwrap(), 0);
        assert!(store.backend().get("mapping:g1").await.unwrap().is_none());
        assert!(store.backend().get("reverse:c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parent_delete_cascades() {
        let store = store();
        store.set("g1", "c1", &channel("a")).await.unwrap();
        store.set("g1", "c2", &channel("b")).await.unwrap();
        store.set("g2", "c1", &channel("c")).await.unwrap();

        store.parent_delete("g1").await.unwrap();

        assert!(store.get_for_parent("g1").await.unwrap().is_none());
        assert_eq!(store.size_for_parent("g1").await.unwrap(), 0);
        assert_eq!(raw_index(&store, "reverse:c1").await, vec!["g2"]);
        assert!(store.backend().get("reverse:c2").await.unwrap().is_none());
        assert_eq!(store.size().await.unwrap(), 1);
        assert_eq!(store.get("g2", "c1").await.unwrap(), Some(channel("c")));
    }

    #[tokio::test]
    async fn test_resource_delete_cascades() {
        let store = store();
        store.set("g1", "c1", &channel("a")).await.unwrap();
        store.set("g2", "c1", &channel("b")).await.unwrap();
        store.set("g2", "c2", &channel("c")).await.unwrap();

        store.resource_delete("c1").await.unwrap();

        assert!(store.get_for_resource("c1").await.unwrap().is_none());
        assert!(store.backend().get("mapping:g1").await.unwrap().is_none());
        assert_eq!(raw_index(&store, "mapping:g2").await, vec!["c2"]);
        assert_eq!(store.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_value_reads_as_missing() {
        let store = store();
        store
            .backend()
            .set("value:g1:c1", "not json".to_owned())
            .await
            .unwrap();
        assert_eq!(store.get("g1", "c1").await.unwrap(), None);
        assert!(store.backend().get("value:g1:c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_custom_prefixes() {
        let config = StoreConfig::default()
            .with_value_prefix("v/")
            .with_forward_prefix("f/")
            .with_reverse_prefix("r/");
        let store = IndexedStore::<Channel, _>::new(MemoryBackend::new(), config);
        store.set("g1", "c1", &channel("a")).await.unwrap();

        assert!(store.backend().get("v/g1:c1").await.unwrap().is_some());
        assert_eq!(raw_index(&store, "f/g1").await, vec!["c1"]);
        assert_eq!(raw_index(&store, "r/c1").await, vec!["g1"]);
    }

    #[tokio::test]
    async fn test_get_for_resource_keeps_live_parents() {
        let store = store();
        for parent in ["g1", "g2", "g3"] {
            store.set(parent, "c1", &channel(parent)).await.unwrap();
        }
        store.backend().delete("value:g3:c1").await.unwrap();

        let found = store.get_for_resource("c1").await.unwrap().unwrap();
        let mut parents: Vec<_> = found.keys().cloned().collect();
        parents.sort();
        assert_eq!(parents, vec!["g1", "g2"]);
        assert_eq!(raw_index(&store, "reverse:c1").await, vec!["g1", "g2"]);
        assert_eq!(store.size_for_resource("c1").await.unwrap(), 2);
    }

    /// Backend that can reject writes and deletes per namespace
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_values: AtomicBool,
        fail_indices: AtomicBool,
    }

    impl FlakyBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                fail_values: AtomicBool::new(false),
                fail_indices: AtomicBool::new(false),
            }
        }

        fn check(&self, key: &str) -> Result<(), StoreError> {
            let fail = if key.starts_with("value:") {
                &self.fail_values
            } else {
                &self.fail_indices
            };
            if fail.load(Ordering::SeqCst) {
                let err: BoxError = format!("write to {key} rejected").into();
                return Err(err.into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KeyValueStore for FlakyBackend {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
            self.check(key)?;
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.check(key)?;
            self.inner.delete(key).await
        }

        async fn count(&self, prefix: &str) -> Result<usize, StoreError> {
            self.inner.count(prefix).await
        }
    }

    fn flaky_store() -> IndexedStore<Channel, FlakyBackend> {
        IndexedStore::new(FlakyBackend::new(), StoreConfig::default())
    }

    #[tokio::test]
    async fn test_index_write_failures_are_swallowed() {
        let store = flaky_store();
        store.backend().fail_indices.store(true, Ordering::SeqCst);

        store.set("g1", "c1", &channel("a")).await.unwrap();
        assert_eq!(store.get("g1", "c1").await.unwrap(), Some(channel("a")));
        assert!(store.get_for_parent("g1").await.unwrap().is_none());

        // Indices recover once writes succeed again
        store.backend().fail_indices.store(false, Ordering::SeqCst);
        store.set("g1", "c1", &channel("a")).await.unwrap();
        assert_eq!(store.size_for_parent("g1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_value_write_failure_is_returned() {
        let store = flaky_store();
        store.backend().fail_values.store(true, Ordering::SeqCst);

        assert!(store.set("g1", "c1", &channel("a")).await.is_err());
        assert!(store.delete("g1", "c1").await.is_err());

        store.backend().fail_values.store(false, Ordering::SeqCst);
        assert_eq!(store.get("g1", "c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_swallows_index_failures() {
        let store = flaky_store();
        store.set("g1", "c1", &channel("a")).await.unwrap();
        store.backend().fail_indices.store(true, Ordering::SeqCst);

        store.delete("g1", "c1").await.unwrap();
        assert_eq!(store.get("g1", "c1").await.unwrap(), None);
        // The stale entry is left behind and pruned by the next aggregate read
        assert_eq!(raw_index(&store, "mapping:g1").await, vec!["c1"]);

        store.backend().fail_indices.store(false, Ordering::SeqCst);
        assert!(store.get_for_parent("g1").await.unwrap().is_none());
        assert!(store.backend().get("mapping:g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cascade_swallows_index_failures() {
        let store = flaky_store();
        store.set("g1", "c1", &channel("a")).await.unwrap();
        store.set("g1", "c2", &channel("b")).await.unwrap();
        store.backend().fail_indices.store(true, Ordering::SeqCst);

        store.parent_delete("g1").await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
        assert_eq!(store.get("g1", "c1").await.unwrap(), None);

        store.resource_delete("c1").await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
    }

    /// Backend that suspends on every call, as a networked store does
    struct YieldingBackend {
        inner: MemoryBackend,
    }

    #[async_trait]
    impl KeyValueStore for YieldingBackend {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            tokio::task::yield_now().await;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.inner.delete(key).await
        }

        async fn count(&self, prefix: &str) -> Result<usize, StoreError> {
            self.inner.count(prefix).await
        }
    }

    fn yielding_store() -> IndexedStore<Channel, YieldingBackend> {
        IndexedStore::new(
            YieldingBackend {
                inner: MemoryBackend::new(),
            },
            StoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_concurrent_sets_keep_every_index_entry() {
        let store = yielding_store();
        let channels = ["c1", "c2", "c3", "c4", "c5"].map(|id| (id, channel(id)));
        let parents = ["g2", "g3", "g4"].map(|parent| (parent, channel(parent)));

        try_join_all(channels.iter().map(|(id, value)| store.set("g1", id, value)))
            .await
            .unwrap();
        try_join_all(parents.iter().map(|(parent, value)| store.set(parent, "c1", value)))
            .await
            .unwrap();

        assert_eq!(store.size_for_parent("g1").await.unwrap(), 5);
        assert_eq!(store.get_for_parent("g1").await.unwrap().unwrap().len(), 5);
        assert_eq!(store.size_for_resource("c1").await.unwrap(), 4);
        assert!(store.index_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_deletes_remove_every_index_entry() {
        let store = yielding_store();
        for id in ["c1", "c2", "c3", "c4"] {
            store.set("g1", id, &channel(id)).await.unwrap();
        }

        try_join_all(["c1", "c2", "c3"].iter().map(|id| store.delete("g1", id)))
            .await
            .unwrap();

        assert_eq!(raw_index(&store, "mapping:g1").await, vec!["c4"]);
    }

    #[tokio::test]
    async fn test_prune_keeps_entries_added_concurrently() {
        let store = yielding_store();
        for id in ["c1", "c2"] {
            store.set("g1", id, &channel(id)).await.unwrap();
        }
        store.backend().inner.delete("value:g1:c2").await.unwrap();

        let c3 = channel("c3");
        let (found, added) = tokio::join!(store.get_for_parent("g1"), store.set("g1", "c3", &c3));
        assert!(found.unwrap().is_some());
        added.unwrap();

        let mut ids = raw_index(&store, "mapping:g1").await;
        ids.sort();
        assert_eq!(ids, vec!["c1", "c3"]);
    }
}
