//! Placement registry and node discovery.
//!
//! A [`Discovery`] lists the nodes a client may talk to; a [`Registry`]
//! additionally maps keys (container ids, node ids) to the node that
//! serves them. Registry entries are hints: they are written whenever a
//! call reveals where something lives and may be stale at any time.
//!
//! Two families of backends exist, chosen when the process is wired up:
//! [`StoreRegistry`] over any [`crate::Store`], and the Consul-backed
//! [`ConsulRegistry`] and [`ConsulDiscovery`].

mod consul;
mod fixed;
mod store;

use std::collections::BTreeMap;

use burrow_common::constants::{META_ATTACH_ADDR, META_ATTACH_NETWORK};
use burrow_common::error::Result;
use serde::{Deserialize, Serialize};

pub use consul::{ConsulDiscovery, ConsulRegistry};
pub use fixed::{PeerDiscovery, StaticDiscovery};
pub use store::StoreRegistry;

/// A node as seen by clients: where to send control calls and how to
/// attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identity, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Control channel address.
    pub addr: String,
    /// Service metadata such as the attach endpoint.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl Node {
    /// Creates a node known only by its control address.
    pub fn at(addr: impl Into<String>) -> Self {
        Self {
            id: None,
            addr: addr.into(),
            meta: BTreeMap::new(),
        }
    }

    /// Sets the node identity.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Advertises a TCP attach endpoint.
    #[must_use]
    pub fn with_attach(mut self, attach_addr: impl Into<String>) -> Self {
        let _ = self
            .meta
            .insert(META_ATTACH_NETWORK.into(), "tcp".into());
        let _ = self.meta.insert(META_ATTACH_ADDR.into(), attach_addr.into());
        self
    }

    /// Advertised attach address, if any.
    pub fn attach_addr(&self) -> Option<&str> {
        self.meta.get(META_ATTACH_ADDR).map(String::as_str)
    }
}

/// Source of the node list used for broadcasts and node-id lookups.
pub trait Discovery: Send + Sync {
    /// Lists every known node.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    fn list(&self) -> Result<Vec<Node>>;

    /// Releases backend resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to shut down cleanly.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Keyed lookup from an id to the node serving it.
pub trait Registry: Discovery {
    /// Looks up a key; `None` if there is no entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    fn get(&self, key: &str) -> Result<Option<Node>>;

    /// Records `node` under `key`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the write.
    fn put(&self, key: &str, node: &Node) -> Result<()>;

    /// Removes the entry for `key`; removing a missing entry succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the delete.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Self-registration of a serving node.
pub trait Announce: Send + Sync {
    /// Advertises `node` so clients can discover it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the registration.
    fn announce(&self, node: &Node) -> Result<()>;

    /// Withdraws a previous announcement.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the removal.
    fn withdraw(&self, node: &Node) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_metadata_roundtrips_through_json() {
        let node = Node::at("10.0.0.1:7420")
            .with_id("n1")
            .with_attach("10.0.0.1:7421");
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"attachNetwork\":\"tcp\""));
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back.attach_addr(), Some("10.0.0.1:7421"));
        assert_eq!(back, node);
    }

    #[test]
    fn bare_node_parses_without_meta() {
        let node: Node = serde_json::from_str(r#"{"addr":"h:1"}"#).unwrap();
        assert_eq!(node, Node::at("h:1"));
        assert!(node.attach_addr().is_none());
    }
}
