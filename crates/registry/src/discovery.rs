//! Watch-driven node discovery.
//!
//! Seeds the node directory with a prefix read, then applies change events
//! from a watch that starts right after the seed revision.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::etcd::EtcdGatewayStore;
use crate::nodes::NodeDirectory;
use crate::store::{CoordinationStore, WatchEvent};

/// Why a discovery loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Cancelled,
    /// The store ended the watch, treated as an intentional shutdown.
    StoreClosed,
}

pub struct Discovery {
    store: Arc<dyn CoordinationStore>,
    nodes: Arc<dyn NodeDirectory>,
    prefix: String,
}

impl Discovery {
    pub fn new(store: Arc<dyn CoordinationStore>, nodes: Arc<dyn NodeDirectory>) -> Self {
        Self {
            store,
            nodes,
            prefix: String::new(),
        }
    }

    pub fn with_prefix<P: Into<String>>(mut self, prefix: P) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn node_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
            .filter(|name| !name.is_empty())
    }

    /// Replaces the directory contents with the store's current view and
    /// returns the revision it was read at.
    pub async fn sync(&self) -> Result<i64> {
        let snapshot = self.store.get_prefix(&self.prefix).await?;

        let mut seen = HashSet::with_capacity(snapshot.kvs.len());
        for kv in &snapshot.kvs {
            let Some(name) = self.node_name(&kv.key) else {
                continue;
            };
            info!(node = %name, address = %kv.value, "initial node found");
            self.nodes.upsert(name, &kv.value);
            seen.insert(name.to_string());
        }
        for (name, _) in self.nodes.list() {
            if !seen.contains(&name) {
                self.nodes.remove(&name);
            }
        }

        debug!(revision = snapshot.revision, nodes = seen.len(), "initial sync complete");
        Ok(snapshot.revision)
    }

    fn apply(&self, event: WatchEvent) {
        counter!("filemesh_discovery_events_total").increment(1);
        let Some(name) = self.node_name(event.key()) else {
            return;
        };
        match &event {
            WatchEvent::Put(kv) => {
                info!(node = %name, address = %kv.value, "node added/updated");
                self.nodes.upsert(name, &kv.value);
            }
            WatchEvent::Delete { .. } => {
                info!(node = %name, "node removed");
                self.nodes.remove(name);
            }
        }
    }

    /// Syncs, then follows changes until `cancel` fires or the store ends
    /// the watch.
    pub async fn run(&self, cancel: CancellationToken) -> Result<DiscoveryOutcome> {
        let revision = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(DiscoveryOutcome::Cancelled),
            revision = self.sync() => revision?,
        };
        let mut events = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(DiscoveryOutcome::Cancelled),
            events = self.store.watch_prefix(&self.prefix, revision + 1) => match events {
                Ok(events) => events,
                Err(RegistryError::Closed) => return Ok(DiscoveryOutcome::StoreClosed),
                Err(err) => return Err(err),
            },
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("discovery cancelled");
                    return Ok(DiscoveryOutcome::Cancelled);
                }
                batch = events.next() => match batch {
                    Some(Ok(batch)) => {
                        for event in batch {
                            self.apply(event);
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "discovery watch failed");
                        return Err(err);
                    }
                    None => {
                        info!("discovery watch closed by store");
                        return Ok(DiscoveryOutcome::StoreClosed);
                    }
                },
            }
        }
    }
}

/// Connects to etcd at `endpoint` and maintains `nodes` until `cancel` fires.
pub async fn discover(
    endpoint: &str,
    dial_timeout: Duration,
    key_prefix: &str,
    nodes: Arc<dyn NodeDirectory>,
    cancel: CancellationToken,
) -> Result<DiscoveryOutcome> {
    let store: Arc<dyn CoordinationStore> =
        Arc::new(EtcdGatewayStore::connect(endpoint, dial_timeout).await?);
    let outcome = Discovery::new(store.clone(), nodes)
        .with_prefix(key_prefix)
        .run(cancel)
        .await;
    store.close().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinationStore;
    use crate::nodes::NodeMap;

    fn discovery(store: &Arc<MemoryCoordinationStore>, nodes: &Arc<NodeMap>) -> Discovery {
        Discovery::new(store.clone(), nodes.clone()).with_prefix("nodes/")
    }

    #[tokio::test]
    async fn sync_mirrors_store_exactly() {
        let store = Arc::new(MemoryCoordinationStore::new());
        store.put("nodes/n1", "10.0.0.1:9000", None).await.unwrap();
        store.put("nodes/n2", "10.0.0.2:9000", None).await.unwrap();
        store.put("other/x", "ignored", None).await.unwrap();
        let nodes = NodeMap::shared();
        nodes.upsert("stale", "gone:1");

        let revision = discovery(&store, &nodes).sync().await.unwrap();
        assert_eq!(revision, 3);
        assert_eq!(
            nodes.list(),
            vec![
                ("n1".to_string(), "10.0.0.1:9000".to_string()),
                ("n2".to_string(), "10.0.0.2:9000".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn events_are_applied_in_order() {
        let store = Arc::new(MemoryCoordinationStore::new());
        store.put("nodes/n1", "a", None).await.unwrap();
        let nodes = NodeMap::shared();
        let cancel = CancellationToken::new();

        let task = {
            let discovery = discovery(&store, &nodes);
            let cancel = cancel.clone();
            tokio::spawn(async move { discovery.run(cancel).await })
        };

        wait_for(|| nodes.contains("n1")).await;
        store.put("nodes/n2", "b", None).await.unwrap();
        store.put("nodes/n1", "a2", None).await.unwrap();
        store.delete("nodes/n2").await.unwrap();
        store.put("nodes/n3", "c", None).await.unwrap();
        wait_for(|| nodes.contains("n3")).await;

        assert_eq!(nodes.get("n1").as_deref(), Some("a2"));
        assert!(!nodes.contains("n2"));

        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap(), DiscoveryOutcome::Cancelled);
    }

    #[tokio::test]
    async fn store_shutdown_ends_discovery_normally() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let nodes = NodeMap::shared();
        let task = {
            let discovery = discovery(&store, &nodes);
            tokio::spawn(async move { discovery.run(CancellationToken::new()).await })
        };

        store.put("nodes/n1", "a", None).await.unwrap();
        wait_for(|| nodes.contains("n1")).await;
        store.shutdown();
        assert_eq!(task.await.unwrap().unwrap(), DiscoveryOutcome::StoreClosed);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let nodes = NodeMap::shared();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = discovery(&store, &nodes).run(cancel).await.unwrap();
        assert_eq!(outcome, DiscoveryOutcome::Cancelled);
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }
}
