//! Discovery over a fixed set of nodes.

use burrow_common::error::Result;

use super::{Discovery, Node};

/// Discovery that always returns one configured peer.
#[derive(Debug, Clone)]
pub struct PeerDiscovery {
    peer: Node,
}

impl PeerDiscovery {
    /// Creates discovery for a single peer.
    pub const fn new(peer: Node) -> Self {
        Self { peer }
    }

    /// The configured peer.
    pub const fn peer(&self) -> &Node {
        &self.peer
    }
}

impl Discovery for PeerDiscovery {
    fn list(&self) -> Result<Vec<Node>> {
        Ok(vec![self.peer.clone()])
    }
}

/// Discovery over a static list of control addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    nodes: Vec<Node>,
}

impl StaticDiscovery {
    /// Creates discovery for the given nodes.
    pub const fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    /// Creates discovery from bare control addresses.
    pub fn from_addrs<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: addrs.into_iter().map(Node::at).collect(),
        }
    }
}

impl Discovery for StaticDiscovery {
    fn list(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_discovery_lists_all_addresses() {
        let discovery = StaticDiscovery::from_addrs(["a:1", "b:2"]);
        let addrs: Vec<String> = discovery
            .list()
            .unwrap()
            .into_iter()
            .map(|n| n.addr)
            .collect();
        assert_eq!(addrs, vec!["a:1", "b:2"]);
    }

    #[test]
    fn peer_discovery_is_single() {
        let discovery = PeerDiscovery::new(Node::at("p:9"));
        assert_eq!(discovery.list().unwrap(), vec![Node::at("p:9")]);
    }
}
