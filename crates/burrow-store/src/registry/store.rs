//! Registry over a versioned store.

use std::sync::Arc;

use burrow_common::error::{BurrowError, Result};

use super::{Announce, Discovery, Node, Registry};
use crate::{PrefixStore, Store};

/// Attempts before a contended registry write gives up.
const PUT_ATTEMPTS: usize = 8;

/// [`Registry`] storing one JSON-encoded [`Node`] per key.
///
/// Used with a prefix such as `nodes` it doubles as discovery and as the
/// announcement target for serving nodes.
#[derive(Debug, Clone)]
pub struct StoreRegistry {
    store: PrefixStore,
}

impl StoreRegistry {
    /// Creates a registry under `prefix` of `store`.
    pub fn new(store: Arc<dyn Store>, prefix: &str) -> Self {
        Self {
            store: PrefixStore::new(store, prefix),
        }
    }
}

impl Discovery for StoreRegistry {
    fn list(&self) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        self.store.list("", &mut |key, _, value| {
            match serde_json::from_slice::<Node>(value) {
                Ok(node) => nodes.push(node),
                Err(e) => tracing::warn!(key, error = %e, "skipping malformed registry entry"),
            }
            Ok(())
        })?;
        Ok(nodes)
    }

    fn close(&self) -> Result<()> {
        self.store.close()
    }
}

impl Registry for StoreRegistry {
    fn get(&self, key: &str) -> Result<Option<Node>> {
        match self.store.get(key) {
            Ok((_, value)) => Ok(Some(serde_json::from_slice(&value)?)),
            Err(BurrowError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&self, key: &str, node: &Node) -> Result<()> {
        let value = serde_json::to_vec(node)?;
        for _ in 0..PUT_ATTEMPTS {
            let version = match self.store.get(key) {
                Ok((_, current)) if current == value => return Ok(()),
                Ok((version, _)) => version,
                Err(BurrowError::NotFound { .. }) => 0,
                Err(e) => return Err(e),
            };
            match self.store.put(key, version, &value) {
                Ok(_) => return Ok(()),
                Err(BurrowError::StaleWrite { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Err(BurrowError::StaleWrite {
            key: key.to_string(),
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        for _ in 0..PUT_ATTEMPTS {
            let version = match self.store.get(key) {
                Ok((version, _)) => version,
                Err(BurrowError::NotFound { .. }) => return Ok(()),
                Err(e) => return Err(e),
            };
            match self.store.delete(key, version) {
                Ok(()) | Err(BurrowError::NotFound { .. }) => return Ok(()),
                Err(BurrowError::StaleWrite { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Err(BurrowError::StaleWrite {
            key: key.to_string(),
        })
    }
}

impl Announce for StoreRegistry {
    fn announce(&self, node: &Node) -> Result<()> {
        let key = node.id.as_deref().unwrap_or(&node.addr);
        self.put(key, node)
    }

    fn withdraw(&self, node: &Node) -> Result<()> {
        let key = node.id.as_deref().unwrap_or(&node.addr);
        self.delete(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JsonStore;

    fn registry() -> StoreRegistry {
        StoreRegistry::new(Arc::new(JsonStore::memory()), "cntrs")
    }

    #[test]
    fn put_get_delete() {
        let reg = registry();
        assert!(reg.get("n1,1").unwrap().is_none());
        reg.put("n1,1", &Node::at("a:1")).unwrap();
        reg.put("n1,1", &Node::at("b:2")).unwrap();
        assert_eq!(reg.get("n1,1").unwrap(), Some(Node::at("b:2")));
        reg.delete("n1,1").unwrap();
        assert!(reg.get("n1,1").unwrap().is_none());
        reg.delete("n1,1").unwrap();
    }

    #[test]
    fn announced_nodes_are_discoverable() {
        let reg = registry();
        let node = Node::at("h:7420").with_id("n1").with_attach("h:7421");
        reg.announce(&node).unwrap();
        assert_eq!(reg.list().unwrap(), vec![node.clone()]);
        assert_eq!(reg.get("n1").unwrap(), Some(node.clone()));
        reg.withdraw(&node).unwrap();
        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn registries_with_different_prefixes_are_disjoint() {
        let store: Arc<dyn Store> = Arc::new(JsonStore::memory());
        let nodes = StoreRegistry::new(Arc::clone(&store), "nodes");
        let cntrs = StoreRegistry::new(store, "cntrs");
        nodes.put("n1", &Node::at("a:1")).unwrap();
        assert!(cntrs.list().unwrap().is_empty());
    }
}
