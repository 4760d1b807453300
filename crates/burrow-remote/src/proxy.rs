//! Client-side proxy implementing [`Manager`] and [`Cntr`] over the
//! control channel.
//!
//! A proxy either talks to one configured peer, or resolves the owner of
//! each container through a [`Registry`] and reaches every node listed by
//! a [`Discovery`] for creation and unscoped listing. Registry entries are
//! hints: they are refreshed whenever a reply reveals where a container
//! lives and are never trusted beyond the call that used them.

use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use burrow_common::constants::DEFAULT_CALL_TIMEOUT_SECS;
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{CntrSpec, Cntrinfo, Taskinfo, split_id};
use burrow_runtime::query::split_scope;
use burrow_runtime::{Attacher, Cntr, CntrVisitor, Manager, TaskVisitor};
use burrow_store::registry::{Discovery, Node, Registry};
use serde::de::DeserializeOwned;

use crate::client::RpcClient;
use crate::wire::{AttachGrant, Call, transport};

/// Deadlines used by a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyOptions {
    /// Deadline for connecting and for every call except waits.
    pub call_timeout: Duration,
    /// Deadline for [`Cntr::wait`]; `None` waits as long as it takes.
    pub wait_timeout: Option<Duration>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            wait_timeout: None,
        }
    }
}

enum Placement {
    Single(Node),
    Cluster {
        discovery: Arc<dyn Discovery>,
        registry: Arc<dyn Registry>,
    },
}

struct Inner {
    placement: Placement,
    clients: Mutex<HashMap<String, Arc<RpcClient>>>,
    options: ProxyOptions,
}

/// [`Manager`] backed by remote nodes.
#[derive(Clone)]
pub struct CntrProxy {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CntrProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.inner.placement {
            Placement::Single(node) => node.addr.as_str(),
            Placement::Cluster { .. } => "cluster",
        };
        f.debug_struct("CntrProxy").field("placement", &mode).finish_non_exhaustive()
    }
}

impl CntrProxy {
    /// A proxy that sends every call to `peer`.
    pub fn single(peer: Node, options: ProxyOptions) -> Self {
        Self::with_placement(Placement::Single(peer), options)
    }

    /// A proxy spanning every node `discovery` lists, resolving container
    /// owners through `registry`.
    pub fn new(discovery: Arc<dyn Discovery>, registry: Arc<dyn Registry>, options: ProxyOptions) -> Self {
        Self::with_placement(
            Placement::Cluster {
                discovery,
                registry,
            },
            options,
        )
    }

    fn with_placement(placement: Placement, options: ProxyOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                placement,
                clients: Mutex::new(HashMap::new()),
                options,
            }),
        }
    }
}

impl Inner {
    fn clients(&self) -> MutexGuard<'_, HashMap<String, Arc<RpcClient>>> {
        match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the cached connection to `addr`, dialing one if needed.
    fn client(&self, addr: &str) -> Result<Arc<RpcClient>> {
        if let Some(client) = self.clients().get(addr).filter(|c| c.is_alive()) {
            return Ok(Arc::clone(client));
        }
        let fresh = Arc::new(RpcClient::connect(addr, self.options.call_timeout)?);
        let mut clients = self.clients();
        match clients.get(addr) {
            Some(raced) if raced.is_alive() => Ok(Arc::clone(raced)),
            _ => {
                let _ = clients.insert(addr.to_string(), Arc::clone(&fresh));
                Ok(fresh)
            }
        }
    }

    fn call_node<T: DeserializeOwned>(&self, node: &Node, call: Call, deadline: Option<Duration>) -> Result<T> {
        let client = self.client(&node.addr)?;
        let result = client.call_with_deadline(call, deadline);
        if !client.is_alive() {
            let mut clients = self.clients();
            if clients.get(&node.addr).is_some_and(|c| Arc::ptr_eq(c, &client)) {
                let _ = clients.remove(&node.addr);
                tracing::debug!(addr = %node.addr, "evicted dead connection");
            }
        }
        result
    }

    fn call<T: DeserializeOwned>(&self, node: &Node, call: Call) -> Result<T> {
        self.call_node(node, call, Some(self.options.call_timeout))
    }

    /// Sends a call about container `id` to its owner and returns the
    /// reply with the node that gave it.
    ///
    /// A registry hint is tried first. If the hinted node is unreachable
    /// or does not know the container, the node named in the container id
    /// is looked up through discovery and tried instead, and the registry
    /// is corrected when it answers.
    fn owner_call<T: DeserializeOwned>(&self, id: &str, call: Call, deadline: Option<Duration>) -> Result<(T, Node)> {
        let (discovery, registry) = match &self.placement {
            Placement::Single(node) => return Ok((self.call_node(node, call, deadline)?, node.clone())),
            Placement::Cluster {
                discovery,
                registry,
            } => (discovery, registry),
        };

        let hint = registry.get(id).unwrap_or_else(|e| {
            tracing::warn!(id, error = %e, "placement lookup failed");
            None
        });
        let mut failure = None;
        if let Some(node) = &hint {
            match self.call_node(node, call.clone(), deadline) {
                Ok(reply) => return Ok((reply, node.clone())),
                Err(e) if e.is_transport() || e.is_not_found() => {
                    tracing::debug!(id, addr = %node.addr, error = %e, "placement hint failed");
                    failure = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let owner = match split_id(id) {
            Some((node_id, _)) => match find_node(discovery.as_ref(), node_id) {
                Ok(owner) => owner,
                Err(e) => return Err(failure.unwrap_or(e)),
            },
            None => None,
        };
        match owner {
            Some(node) if hint.as_ref().is_none_or(|stale| stale.addr != node.addr) => {
                let reply = self.call_node(&node, call, deadline)?;
                tracing::debug!(id, addr = %node.addr, "resolved owner from container id");
                self.record(id, &node);
                Ok((reply, node))
            }
            _ => Err(failure.unwrap_or_else(|| BurrowError::NotFound {
                kind: "container",
                id: id.to_string(),
            })),
        }
    }

    fn call_owner<T: DeserializeOwned>(&self, id: &str, call: Call) -> Result<T> {
        self.owner_call(id, call, Some(self.options.call_timeout))
            .map(|(reply, _)| reply)
    }

    fn record(&self, id: &str, node: &Node) {
        if let Placement::Cluster { registry, .. } = &self.placement {
            if let Err(e) = registry.put(id, node) {
                tracing::warn!(id, addr = %node.addr, error = %e, "cannot record placement");
            }
        }
    }

    /// Sends `call` to every node concurrently and returns each node's
    /// result.
    fn broadcast<T>(&self, nodes: Vec<Node>, call: &Call) -> Vec<(Node, Result<T>)>
    where
        T: DeserializeOwned + Send,
    {
        let (tx, rx) = mpsc::channel();
        std::thread::scope(|scope| {
            for node in nodes {
                let tx = tx.clone();
                let call = call.clone();
                let _ = scope.spawn(move || {
                    let result = self.call(&node, call);
                    let _ = tx.send((node, result));
                });
            }
        });
        drop(tx);
        rx.into_iter().collect()
    }

    fn broadcast_create(&self, discovery: &dyn Discovery, spec: &CntrSpec) -> Result<String> {
        let nodes = discovery.list()?;
        if nodes.is_empty() {
            return Err(transport("cluster", "no nodes discovered"));
        }
        let mut winner: Option<(String, Node)> = None;
        let mut last_err = None;
        for (node, result) in self.broadcast::<String>(nodes, &Call::Create { spec: spec.clone() }) {
            match result {
                Ok(id) if winner.is_none() => winner = Some((id, node)),
                Ok(id) => {
                    tracing::warn!(id = %id, addr = %node.addr, "orphaned container from broadcast create");
                }
                Err(e) => {
                    tracing::debug!(addr = %node.addr, error = %e, "create refused");
                    last_err = Some(e);
                }
            }
        }
        match winner {
            Some((id, node)) => {
                self.record(&id, &node);
                tracing::info!(id = %id, addr = %node.addr, "container placed");
                Ok(id)
            }
            None => Err(last_err.unwrap_or_else(|| transport("cluster", "all nodes failed"))),
        }
    }

    fn cluster_list(&self, discovery: &dyn Discovery, query: &str) -> Result<Vec<Cntrinfo>> {
        let nodes = match split_scope(query).0 {
            Some(node_id) => match find_node(discovery, node_id)? {
                Some(node) => vec![node],
                None => return Ok(Vec::new()),
            },
            None => discovery.list()?,
        };
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let results = self.broadcast::<Vec<Cntrinfo>>(nodes, &Call::List {
            query: query.to_string(),
        });
        let mut found = Vec::new();
        let mut reached = false;
        let mut unreachable = None;
        for (node, result) in results {
            match result {
                Ok(infos) => {
                    reached = true;
                    for info in &infos {
                        self.record(&info.id, &node);
                    }
                    found.extend(infos);
                }
                Err(e) if e.is_transport() => {
                    tracing::warn!(addr = %node.addr, error = %e, "node unreachable, skipping");
                    unreachable = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        match unreachable {
            Some(e) if !reached => Err(e),
            _ => Ok(found),
        }
    }
}

/// Looks a node up by identity.
fn find_node(discovery: &dyn Discovery, node_id: &str) -> Result<Option<Node>> {
    Ok(discovery
        .list()?
        .into_iter()
        .find(|node| node.id.as_deref() == Some(node_id)))
}

impl Manager for CntrProxy {
    fn id(&self) -> Result<String> {
        match &self.inner.placement {
            Placement::Single(node) => self.inner.call(node, Call::Id),
            Placement::Cluster { .. } => Ok(String::new()),
        }
    }

    fn create(&self, spec: &CntrSpec) -> Result<String> {
        match &self.inner.placement {
            Placement::Single(node) => self.inner.call(node, Call::Create { spec: spec.clone() }),
            Placement::Cluster { discovery, .. } => self.inner.broadcast_create(discovery.as_ref(), spec),
        }
    }

    fn get(&self, id: &str) -> Result<Arc<dyn Cntr>> {
        let _: Cntrinfo = self.inner.call_owner(id, Call::ContainerMeta { id: id.to_string() })?;
        Ok(Arc::new(RemoteCntr {
            id: id.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.inner.call_owner::<()>(id, Call::Delete { id: id.to_string() })?;
        if let Placement::Cluster { registry, .. } = &self.inner.placement {
            if let Err(e) = registry.delete(id) {
                tracing::warn!(id, error = %e, "cannot remove placement");
            }
        }
        Ok(())
    }

    fn list(&self, query: &str, visit: &mut CntrVisitor<'_>) -> Result<()> {
        let infos = match &self.inner.placement {
            Placement::Single(node) => self.inner.call(node, Call::List {
                query: query.to_string(),
            })?,
            Placement::Cluster { discovery, .. } => self.inner.cluster_list(discovery.as_ref(), query)?,
        };
        for info in &infos {
            visit(info)?;
        }
        Ok(())
    }

    fn update_tags(&self, id: &str, tags: Vec<String>) -> Result<()> {
        self.inner.call_owner(id, Call::Config {
            id: id.to_string(),
            tags,
        })
    }

    fn close(&self) -> Result<()> {
        for (_, client) in self.inner.clients().drain() {
            client.close();
        }
        Ok(())
    }
}

/// [`Cntr`] living on a remote node.
struct RemoteCntr {
    id: String,
    inner: Arc<Inner>,
}

impl RemoteCntr {
    fn call<T: DeserializeOwned>(&self, call: Call) -> Result<T> {
        self.inner.call_owner(&self.id, call)
    }
}

impl Cntr for RemoteCntr {
    fn meta(&self) -> Result<Cntrinfo> {
        self.call(Call::ContainerMeta { id: self.id.clone() })
    }

    fn start(&self, task: &Taskinfo) -> Result<String> {
        self.call(Call::TaskStart {
            id: self.id.clone(),
            task: task.clone(),
        })
    }

    fn stop(&self, task: &str, kill: bool) -> Result<()> {
        self.call(Call::TaskStop {
            id: self.id.clone(),
            task: task.to_string(),
            kill,
        })
    }

    fn stop_all(&self, kill: bool) -> Result<()> {
        self.call(Call::TaskStopAll {
            id: self.id.clone(),
            kill,
        })
    }

    fn wait(&self) -> Result<()> {
        let ((), _) = self.inner.owner_call(
            &self.id,
            Call::TaskWait { id: self.id.clone() },
            self.inner.options.wait_timeout,
        )?;
        Ok(())
    }

    fn attach(&self, task: &str) -> Result<Box<dyn Attacher>> {
        let (grant, node): (AttachGrant, Node) = self.inner.owner_call(
            &self.id,
            Call::AttachToken {
                id: self.id.clone(),
                task: task.to_string(),
            },
            Some(self.inner.options.call_timeout),
        )?;
        let addr = attach_target(&node.addr, &grant.attach_addr)?;
        let mut stream = TcpStream::connect_timeout(&addr, self.inner.options.call_timeout)
            .map_err(|e| transport(&grant.attach_addr, e))?;
        let _ = stream.set_nodelay(true);
        stream
            .write_all(grant.token.as_bytes())
            .map_err(|e| transport(&grant.attach_addr, e))?;
        tracing::debug!(id = %self.id, task, addr = %addr, "attached");
        Ok(Box::new(stream))
    }

    fn list(&self, visit: &mut TaskVisitor<'_>) -> Result<()> {
        let tasks: Vec<String> = self.call(Call::TaskList { id: self.id.clone() })?;
        for task in &tasks {
            visit(task)?;
        }
        Ok(())
    }
}

/// Where to dial an attach listener. A listener bound to a wildcard
/// address is reached at the host of the control address.
fn attach_target(control: &str, attach: &str) -> Result<SocketAddr> {
    let mut addr = first_addr(attach)?;
    if addr.ip().is_unspecified() {
        addr.set_ip(first_addr(control)?.ip());
    }
    Ok(addr)
}

fn first_addr(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| transport(addr, e))?
        .next()
        .ok_or_else(|| transport(addr, "address resolved to nothing"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_store::registry::StaticDiscovery;

    #[test]
    fn wildcard_attach_address_takes_control_host() {
        let addr = attach_target("127.0.0.1:7420", "0.0.0.0:7421").unwrap();
        assert_eq!(addr, "127.0.0.1:7421".parse().unwrap());
        let addr = attach_target("127.0.0.1:7420", "127.0.0.2:9000").unwrap();
        assert_eq!(addr, "127.0.0.2:9000".parse().unwrap());
    }

    #[test]
    fn nodes_are_found_by_identity() {
        let discovery = StaticDiscovery::new(vec![
            Node::at("10.0.0.1:7420").with_id("a"),
            Node::at("10.0.0.2:7420").with_id("b"),
            Node::at("10.0.0.3:7420"),
        ]);
        let node = find_node(&discovery, "b").unwrap().unwrap();
        assert_eq!(node.addr, "10.0.0.2:7420");
        assert!(find_node(&discovery, "c").unwrap().is_none());
    }

    #[test]
    fn cluster_proxy_has_no_identity() {
        let discovery: Arc<dyn Discovery> = Arc::new(StaticDiscovery::default());
        let registry: Arc<dyn Registry> = Arc::new(burrow_store::registry::StoreRegistry::new(
            Arc::new(burrow_store::JsonStore::memory()),
            "placement",
        ));
        let proxy = CntrProxy::new(discovery, registry, ProxyOptions::default());
        assert_eq!(proxy.id().unwrap(), "");
        assert!(proxy.get("ghost,1").err().unwrap().is_not_found());
        assert!(proxy.create(&CntrSpec::default()).unwrap_err().is_transport());
    }
}
