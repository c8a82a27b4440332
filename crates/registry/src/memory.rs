//! In-process coordination store.
//!
//! Mirrors the etcd semantics the registry relies on: global revisions,
//! TTL leases whose keys vanish on expiry, and prefix watches that replay
//! history from a start revision. Expiry is evaluated lazily on every call
//! and can be forced with [`MemoryCoordinationStore::reap_expired`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{RegistryError, Result};
use crate::store::{CoordinationStore, KeyValue, LeaseId, PrefixSnapshot, WatchEvent, WatchStream};

const WATCH_CHANNEL_CAPACITY: usize = 1024;
/// Changes kept for watch replay before older revisions are compacted.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
}

struct Inner {
    revision: i64,
    next_lease: LeaseId,
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    history: VecDeque<(i64, WatchEvent)>,
    history_limit: usize,
    /// Highest revision dropped from `history`.
    compacted: i64,
    events: Option<broadcast::Sender<(i64, WatchEvent)>>,
}

impl Inner {
    fn record(&mut self, event: WatchEvent) {
        self.revision += 1;
        self.history.push_back((self.revision, event.clone()));
        while self.history.len() > self.history_limit {
            if let Some((revision, _)) = self.history.pop_front() {
                self.compacted = revision;
            }
        }
        if let Some(events) = &self.events {
            // no subscribers is fine
            let _ = events.send((self.revision, event));
        }
    }

    fn remove_key(&mut self, key: &str) -> bool {
        if self.kvs.remove(key).is_some() {
            self.record(WatchEvent::Delete {
                key: key.to_string(),
            });
            true
        } else {
            false
        }
    }

    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        if self.leases.remove(&lease).is_none() {
            return false;
        }
        let bound: Vec<String> = self
            .kvs
            .iter()
            .filter(|(_, entry)| entry.lease == Some(lease))
            .map(|(key, _)| key.clone())
            .collect();
        for key in bound {
            self.remove_key(&key);
        }
        true
    }

    fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            debug!(lease = id, "lease expired");
            self.drop_lease(*id);
        }
        expired.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.events.is_none() {
            return Err(RegistryError::Closed);
        }
        Ok(())
    }
}

pub struct MemoryCoordinationStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Keeps at most `limit` changes for replay (at least one). Watches
    /// starting at or below a compacted revision are refused.
    pub fn with_history_limit(limit: usize) -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                revision: 0,
                next_lease: 1,
                kvs: BTreeMap::new(),
                leases: HashMap::new(),
                history: VecDeque::new(),
                history_limit: limit.max(1),
                compacted: 0,
                events: Some(events),
            }),
        }
    }

    /// Expires every lease past its deadline. Returns how many were removed.
    pub fn reap_expired(&self) -> usize {
        self.inner.lock().expire(Instant::now())
    }

    /// Stops the store: open watch streams end and further calls fail.
    pub fn shutdown(&self) {
        self.inner.lock().events.take();
    }

    pub fn revision(&self) -> i64 {
        self.inner.lock().revision
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        inner.expire(Instant::now());
        inner.kvs.get(key).map(|entry| entry.value.clone())
    }

    /// Highest revision no longer available for watch replay.
    pub fn compacted_revision(&self) -> i64 {
        self.inner.lock().compacted
    }

    pub fn lease_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.expire(Instant::now());
        inner.leases.len()
    }

    /// Runs `f` against live (non-expired) state.
    fn with_live<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        inner.expire(Instant::now());
        f(&mut inner)
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        if ttl.is_zero() {
            return Err(RegistryError::InvalidConfig("lease ttl must be positive".into()));
        }
        self.with_live(|inner| {
            let id = inner.next_lease;
            inner.next_lease += 1;
            inner.leases.insert(
                id,
                Lease {
                    ttl,
                    deadline: Instant::now() + ttl,
                },
            );
            Ok(id)
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Option<Duration>> {
        self.with_live(|inner| {
            Ok(inner.leases.get_mut(&lease).map(|state| {
                state.deadline = Instant::now() + state.ttl;
                state.ttl
            }))
        })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.with_live(|inner| {
            if inner.drop_lease(lease) {
                Ok(())
            } else {
                Err(RegistryError::Rejected {
                    code: 5,
                    message: format!("lease {lease} not found"),
                })
            }
        })
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        self.with_live(|inner| {
            if let Some(id) = lease {
                if !inner.leases.contains_key(&id) {
                    return Err(RegistryError::Rejected {
                        code: 5,
                        message: format!("lease {id} not found"),
                    });
                }
            }
            inner.kvs.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    lease,
                },
            );
            inner.record(WatchEvent::Put(KeyValue::new(key, value)));
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.with_live(|inner| Ok(inner.remove_key(key)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot> {
        self.with_live(|inner| {
            let kvs = inner
                .kvs
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| KeyValue::new(key.clone(), entry.value.clone()))
                .collect();
            Ok(PrefixSnapshot {
                revision: inner.revision,
                kvs,
            })
        })
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let (replay, receiver) = self.with_live(|inner| {
            if inner.compacted > 0 && start_revision <= inner.compacted {
                return Err(RegistryError::Compacted {
                    requested: start_revision,
                    compacted: inner.compacted,
                });
            }
            let replay: Vec<WatchEvent> = inner
                .history
                .iter()
                .filter(|(revision, event)| {
                    *revision >= start_revision && event.key().starts_with(prefix)
                })
                .map(|(_, event)| event.clone())
                .collect();
            // subscribing under the lock leaves no gap between replay and live events
            let receiver = inner
                .events
                .as_ref()
                .map(|events| events.subscribe())
                .ok_or(RegistryError::Closed)?;
            Ok((replay, receiver))
        })?;

        let prefix = prefix.to_string();
        let replayed = futures::stream::iter(replay.into_iter().map(|event| Ok(vec![event])));
        let live = futures::stream::unfold(receiver, move |mut receiver| {
            let prefix = prefix.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((revision, event)) => {
                            if revision < start_revision || !event.key().starts_with(&prefix) {
                                continue;
                            }
                            return Some((Ok(vec![event]), receiver));
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "watch subscriber lagged behind");
                            return Some((
                                Err(RegistryError::Protocol(format!(
                                    "watch lagged, {skipped} events dropped"
                                ))),
                                receiver,
                            ));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(replayed.chain(live).boxed())
    }

    /// Shared in-process store: clients do not own it, see [`Self::shutdown`].
    async fn close(&self) {}
}
