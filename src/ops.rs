//! Live change feeds
//!
//! The cache stays in sync with its authoritative source through a stream of
//! canonical [`Op`]s. An [`OpsSource`] hands out a fresh stream on every
//! subscription so the consumer can start over after a failure.
//!
//! Producers that expose typed change events implement [`ChangeProducer`];
//! [`CombinedOps`] merges its six sub-feeds into one canonical feed.

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::BoxError;

/// Canonical change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Op<V> {
    Create {
        parent_id: String,
        resource_id: String,
        resource: V,
    },
    Update {
        parent_id: String,
        resource_id: String,
        resource: V,
    },
    Delete {
        parent_id: String,
        resource_id: String,
    },
    ParentDelete {
        parent_id: String,
    },
    ResourceDelete {
        resource_id: String,
    },
}

/// Stream of canonical ops. An `Err` item aborts the current subscription.
pub type OpsStream<V> = BoxStream<'static, Result<Op<V>, BoxError>>;

/// Re-subscribable source of canonical ops
pub trait OpsSource<V>: Send + Sync + 'static {
    fn subscribe(&self) -> OpsStream<V>;
}

/// Feed that never emits anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOps;

impl<V: Send + 'static> OpsSource<V> for NoOps {
    fn subscribe(&self) -> OpsStream<V> {
        stream::empty().boxed()
    }
}

/// In-process op publisher backed by a broadcast channel.
///
/// Ops published while nobody is subscribed are dropped. A subscriber that
/// falls behind by more than the channel capacity sees an error, which makes
/// the consuming cache resubscribe.
#[derive(Clone)]
pub struct OpsBroadcast<V> {
    tx: broadcast::Sender<Op<V>>,
}

impl<V: Clone + Send + 'static> OpsBroadcast<V> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an op. Returns the number of subscribers that received it.
    pub fn publish(&self, op: Op<V>) -> usize {
        self.tx.send(op).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<V: Clone + Send + Sync + 'static> OpsSource<V> for OpsBroadcast<V> {
    fn subscribe(&self) -> OpsStream<V> {
        let rx = self.tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(op) => Some((Ok(op), rx)),
                Err(broadcast::error::RecvError::Closed) => None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let err: BoxError = format!("ops subscriber lagged by {skipped}").into();
                    Some((Err(err), rx))
                }
            }
        })
        .boxed()
    }
}

/// Full reload of all resources under a parent
#[derive(Debug, Clone, PartialEq)]
pub struct BulkLoad<V> {
    pub parent_id: String,
    pub resources: Vec<V>,
}

/// A single resource was created or updated under a parent
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted<V> {
    pub parent_id: String,
    pub resource: V,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub parent_id: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRemoved {
    pub parent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRemoved {
    pub resource_id: String,
}

/// Typed sub-feed of a [`ChangeProducer`]
pub type FeedStream<T> = BoxStream<'static, Result<T, BoxError>>;

/// Upstream system exposing typed change events.
///
/// Every feed defaults to empty; implement the ones the upstream supports.
/// Each call must return a fresh stream.
pub trait ChangeProducer<V: Send + 'static>: Send + Sync + 'static {
    /// Resource id of a resource, used for bulk loads, creates and updates
    fn resource_id(&self, resource: &V) -> String;

    fn bulk_loads(&self) -> FeedStream<BulkLoad<V>> {
        stream::empty().boxed()
    }

    fn creates(&self) -> FeedStream<Upserted<V>> {
        stream::empty().boxed()
    }

    fn updates(&self) -> FeedStream<Upserted<V>> {
        stream::empty().boxed()
    }

    fn removals(&self) -> FeedStream<Removed> {
        stream::empty().boxed()
    }

    fn parent_removals(&self) -> FeedStream<ParentRemoved> {
        stream::empty().boxed()
    }

    fn resource_removals(&self) -> FeedStream<ResourceRemoved> {
        stream::empty().boxed()
    }
}

/// Merges the sub-feeds of a [`ChangeProducer`] into one canonical feed.
///
/// Sub-feeds are polled concurrently; no ordering holds across them.
pub struct CombinedOps<P> {
    producer: Arc<P>,
}

impl<P> Clone for CombinedOps<P> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
        }
    }
}

impl<P> CombinedOps<P> {
    pub fn new(producer: P) -> Self {
        Self {
            producer: Arc::new(producer),
        }
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }
}

impl<V, P> OpsSource<V> for CombinedOps<P>
where
    V: Send + 'static,
    P: ChangeProducer<V>,
{
    fn subscribe(&self) -> OpsStream<V> {
        let producer = Arc::clone(&self.producer);

        let bulk = {
            let producer = Arc::clone(&producer);
            self.producer
                .bulk_loads()
                .flat_map(move |item| {
                    let ops: Vec<Result<Op<V>, BoxError>> = match item {
                        Ok(load) => load
                            .resources
                            .into_iter()
                            .map(|resource| {
                                Ok(Op::Create {
                                    parent_id: load.parent_id.clone(),
                                    resource_id: producer.resource_id(&resource),
                                    resource,
                                })
                            })
                            .collect(),
                        Err(e) => vec![Err(e)],
                    };
                    stream::iter(ops)
                })
                .boxed()
        };

        let creates = {
            let producer = Arc::clone(&producer);
            self.producer
                .creates()
                .map(move |item| {
                    item.map(|created| Op::Create {
                        parent_id: created.parent_id,
                        resource_id: producer.resource_id(&created.resource),
                        resource: created.resource,
                    })
                })
                .boxed()
        };

        let updates = self
            .producer
            .updates()
            .map(move |item| {
                item.map(|updated| Op::Update {
                    parent_id: updated.parent_id,
                    resource_id: producer.resource_id(&updated.resource),
                    resource: updated.resource,
                })
            })
            .boxed();

        let removals = self
            .producer
            .removals()
            .map(|item| {
                item.map(|removed| Op::Delete {
                    parent_id: removed.parent_id,
                    resource_id: removed.resource_id,
                })
            })
            .boxed();

        let parent_removals = self
            .producer
            .parent_removals()
            .map(|item| {
                item.map(|removed| Op::ParentDelete {
                    parent_id: removed.parent_id,
                })
            })
            .boxed();

        let resource_removals = self
            .producer
            .resource_removals()
            .map(|item| {
                item.map(|removed| Op::ResourceDelete {
                    resource_id: removed.resource_id,
                })
            })
            .boxed();

        stream::select_all([
            bulk,
            creates,
            updates,
            removals,
            parent_removals,
            resource_removals,
        ])
        .boxed()
    }
}
