use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Live view of discovered nodes: node name to advertised address.
///
/// Discovery is the only writer; sessions and listing commands read it
/// concurrently.
pub trait NodeDirectory: Send + Sync {
    fn upsert(&self, name: &str, address: &str);
    fn remove(&self, name: &str) -> Option<String>;
    fn get(&self, name: &str) -> Option<String>;
    /// All entries, sorted by name.
    fn list(&self) -> Vec<(String, String)>;

    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn len(&self) -> usize {
        self.list().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct NodeMap {
    nodes: RwLock<BTreeMap<String, String>>,
}

impl NodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl NodeDirectory for NodeMap {
    fn upsert(&self, name: &str, address: &str) {
        self.nodes
            .write()
            .insert(name.to_string(), address.to_string());
    }

    fn remove(&self, name: &str) -> Option<String> {
        self.nodes.write().remove(name)
    }

    fn get(&self, name: &str) -> Option<String> {
        self.nodes.read().get(name).cloned()
    }

    fn list(&self) -> Vec<(String, String)> {
        self.nodes
            .read()
            .iter()
            .map(|(name, address)| (name.clone(), address.clone()))
            .collect()
    }

    fn contains(&self, name: &str) -> bool {
        self.nodes.read().contains_key(name)
    }

    fn len(&self) -> usize {
        self.nodes.read().len()
    }
}
