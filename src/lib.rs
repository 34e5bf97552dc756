//! revcache - Reverse-lookup cache for parent/resource hierarchies
//!
//! Caches child resources owned by parent entities and answers lookups by
//! parent, by resource, or by the `(parent, resource)` pair:
//! - [`Driver`]: storage contract with forward and reverse aggregate lookups
//! - [`IndexedStore`]: dual-indexed driver over any [`KeyValueStore`]
//!   (in-memory Moka or Redis), with self-healing index repair
//! - [`ReverseCache`]: cache-aside orchestration, resolving misses through a
//!   [`ResourceSource`] and applying a live [`OpsSource`] feed in a supervised
//!   background loop
//! - [`CombinedOps`]: merges typed upstream change feeds into canonical [`Op`]s
//!
//! Consistency between values and indices is eventual, not transactional.

mod backend;
mod cache;
mod config;
mod driver;
mod error;
pub mod ops;
mod store;
mod supervisor;

pub use backend::{KeyValueStore, MemoryBackend, RedisBackend};
pub use cache::{ResourceSource, ReverseCache, apply_op};
pub use config::{RetryPolicy, StoreConfig};
pub use driver::{Cacheable, CompoundKey, Driver, NoopDriver};
pub use error::{BoxError, CacheError, StoreError};
pub use ops::{ChangeProducer, CombinedOps, NoOps, Op, OpsBroadcast, OpsSource, OpsStream};
pub use store::IndexedStore;
pub use supervisor::spawn_supervised;

// Re-export async_trait for convenience
pub use async_trait::async_trait;
