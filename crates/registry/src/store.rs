//! Coordination store abstraction.
//!
//! The registry only needs a small slice of an etcd-like store: leases,
//! lease-bound puts, prefix reads and prefix watches. Revisions are global and
//! strictly increasing; a watch started at `snapshot.revision + 1` observes
//! every change after the snapshot exactly once.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Result of a prefix read: the matching pairs and the store revision they
/// were read at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixSnapshot {
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete { key } => key,
        }
    }
}

/// Ordered batches of change events. The stream ends when the store closes
/// the subscription.
pub type WatchStream = BoxStream<'static, Result<Vec<WatchEvent>>>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Renews `lease` once. `Ok(None)` means the lease no longer exists.
    async fn keep_alive(&self, lease: LeaseId) -> Result<Option<Duration>>;

    /// Revokes `lease`, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Returns `true` when a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot>;

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream>;

    /// Releases client resources held for this store.
    async fn close(&self);
}
