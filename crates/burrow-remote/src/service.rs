//! The network-facing container service.
//!
//! A [`CntrService`] serves a [`Manager`] on two listeners: the control
//! channel answers calls, and the attach listener accepts raw connections
//! that open with an attach token issued over the control channel.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use burrow_common::config::NodeConfig;
use burrow_common::constants::{
    ATTACH_TOKEN_LEN, DEFAULT_ATTACH_SESSION_LIMIT, DEFAULT_ATTACH_TOKEN_TTL_SECS,
    DEFAULT_QUERY_LIMIT,
};
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::Cntrinfo;
use burrow_runtime::Manager;
use burrow_store::registry::{Announce, Node};
use serde::Serialize;
use serde_json::Value;

use crate::server::{Acceptor, Connections, Handler, RpcServer};
use crate::splice::splice;
use crate::token::TokenCache;
use crate::wire::{AttachGrant, AttachToken, Call};

/// How long a new attach connection has to present its token.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Limits applied by a [`CntrService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Most results a single list call may return.
    pub query_limit: usize,
    /// Most attach sessions open at once.
    pub attach_session_limit: usize,
    /// Lifetime of an attach token.
    pub token_ttl: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            query_limit: DEFAULT_QUERY_LIMIT,
            attach_session_limit: DEFAULT_ATTACH_SESSION_LIMIT,
            token_ttl: Duration::from_secs(DEFAULT_ATTACH_TOKEN_TTL_SECS),
        }
    }
}

impl ServiceOptions {
    /// Takes the limits from a node configuration.
    pub const fn from_config(config: &NodeConfig) -> Self {
        Self {
            query_limit: config.query_limit,
            attach_session_limit: config.attach_session_limit,
            token_ttl: config.attach_token_ttl(),
        }
    }
}

/// Call handler and attach session state shared by both listeners.
struct Endpoint {
    manager: Arc<dyn Manager>,
    tokens: TokenCache,
    options: ServiceOptions,
    attach_addr: SocketAddr,
    sessions: AtomicUsize,
    stop: Arc<AtomicBool>,
    attach_conns: Connections,
}

impl Endpoint {
    /// Collects at most `query_limit` items, failing rather than
    /// truncating when there are more.
    fn bounded<T>(&self, what: &str, fill: impl FnOnce(&mut dyn FnMut(T) -> Result<()>) -> Result<()>) -> Result<Vec<T>> {
        let limit = self.options.query_limit;
        let mut items = Vec::new();
        fill(&mut |item| {
            if items.len() >= limit {
                return Err(BurrowError::ResourceExhausted {
                    message: format!("{what} matches more than {limit} results"),
                });
            }
            items.push(item);
            Ok(())
        })?;
        Ok(items)
    }

    fn list(&self, query: &str) -> Result<Vec<Cntrinfo>> {
        self.bounded("query", |push| {
            self.manager.list(query, &mut |info| push(info.clone()))
        })
    }

    fn task_list(&self, id: &str) -> Result<Vec<String>> {
        let cntr = self.manager.get(id)?;
        self.bounded("task list", |push| {
            cntr.list(&mut |task| push(task.to_string()))
        })
    }

    fn attach_token(&self, id: &str, task: &str) -> Result<AttachGrant> {
        let cntr = self.manager.get(id)?;
        let mut live = false;
        cntr.list(&mut |candidate| {
            live |= candidate == task;
            Ok(())
        })?;
        if !live {
            return Err(BurrowError::NotFound {
                kind: "task",
                id: task.to_string(),
            });
        }
        Ok(AttachGrant {
            token: self.tokens.issue(id, task),
            attach_addr: self.attach_addr.to_string(),
        })
    }

    /// Runs one attach session to completion.
    fn attach_session(&self, mut conn: TcpStream, peer: SocketAddr) {
        let mut raw = [0_u8; ATTACH_TOKEN_LEN];
        let handshake = conn
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .and_then(|()| conn.read_exact(&mut raw));
        if let Err(e) = handshake {
            tracing::debug!(peer = %peer, error = %e, "attach handshake failed");
            return;
        }

        let opened = self.tokens.redeem(&AttachToken(raw)).and_then(|target| {
            let attacher = self.manager.get(&target.container)?.attach(&target.task)?;
            Ok((target, attacher))
        });
        let (target, mut attacher) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                tracing::info!(peer = %peer, error = %e, "attach refused");
                reject(&mut conn, &e.to_string());
                return;
            }
        };

        tracing::info!(peer = %peer, id = %target.container, task = %target.task, "attach session started");
        if let Err(e) = splice(&conn, attacher.as_mut(), &self.stop) {
            tracing::warn!(peer = %peer, error = %e, "attach session failed");
        }
        tracing::info!(peer = %peer, id = %target.container, task = %target.task, "attach session ended");
    }
}

impl Handler for Endpoint {
    fn handle(&self, call: Call) -> Result<Value> {
        match call {
            Call::Id => reply(self.manager.id()?),
            Call::Create { spec } => reply(self.manager.create(&spec)?),
            Call::Delete { id } => reply(self.manager.delete(&id)?),
            Call::List { query } => reply(self.list(&query)?),
            Call::Config { id, tags } => reply(self.manager.update_tags(&id, tags)?),
            Call::ContainerMeta { id } => reply(self.manager.get(&id)?.meta()?),
            Call::TaskStart { id, task } => reply(self.manager.get(&id)?.start(&task)?),
            Call::TaskStop { id, task, kill } => reply(self.manager.get(&id)?.stop(&task, kill)?),
            Call::TaskStopAll { id, kill } => reply(self.manager.get(&id)?.stop_all(kill)?),
            Call::TaskWait { id } => reply(self.manager.get(&id)?.wait()?),
            Call::TaskList { id } => reply(self.task_list(&id)?),
            Call::AttachToken { id, task } => reply(self.attach_token(&id, &task)?),
        }
    }
}

fn reply<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Tells an attach client why it is being dropped.
fn reject(conn: &mut TcpStream, reason: &str) {
    let _ = conn.write_all(format!("{reason}\n").as_bytes());
}

/// A running container service.
pub struct CntrService {
    endpoint: Arc<Endpoint>,
    rpc: RpcServer,
    attach: Acceptor,
    node: Node,
    announce: Option<Arc<dyn Announce>>,
}

impl std::fmt::Debug for CntrService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CntrService")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl CntrService {
    /// Serves `manager` on the two listeners and, if given, announces the
    /// node through `announce`.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener cannot be served, the node identity
    /// cannot be read, or the announcement is rejected.
    pub fn start(
        manager: Arc<dyn Manager>,
        control: TcpListener,
        attach: TcpListener,
        options: ServiceOptions,
        announce: Option<Arc<dyn Announce>>,
    ) -> Result<Self> {
        let node_id = manager.id()?;
        let attach_addr = attach
            .local_addr()
            .map_err(|e| BurrowError::io("attach listener", e))?;
        let stop = Arc::new(AtomicBool::new(false));
        let endpoint = Arc::new(Endpoint {
            manager,
            tokens: TokenCache::new(options.token_ttl),
            options,
            attach_addr,
            sessions: AtomicUsize::new(0),
            stop: Arc::clone(&stop),
            attach_conns: Connections::default(),
        });

        let rpc = RpcServer::serve(control, Arc::clone(&endpoint) as Arc<dyn Handler>)?;
        let sessions = Arc::clone(&endpoint);
        let attach = match Acceptor::spawn("attach", attach, stop, move |conn, peer| {
            admit(&sessions, conn, peer);
        }) {
            Ok(attach) => attach,
            Err(e) => {
                rpc.shutdown();
                return Err(e);
            }
        };
        tracing::info!(addr = %attach_addr, "attach listener ready");

        let node = Node::at(rpc.local_addr().to_string())
            .with_id(node_id)
            .with_attach(attach_addr.to_string());
        if let Some(announce) = &announce {
            if let Err(e) = announce.announce(&node) {
                rpc.shutdown();
                attach.stop();
                return Err(e);
            }
            tracing::info!(id = ?node.id, addr = %node.addr, "node announced");
        }

        Ok(Self {
            endpoint,
            rpc,
            attach,
            node,
            announce,
        })
    }

    /// How clients reach this node.
    pub const fn node(&self) -> &Node {
        &self.node
    }

    /// Control channel address.
    pub const fn control_addr(&self) -> SocketAddr {
        self.rpc.local_addr()
    }

    /// Attach listener address.
    pub fn attach_addr(&self) -> SocketAddr {
        self.endpoint.attach_addr
    }

    /// Number of attach sessions currently open.
    pub fn attach_sessions(&self) -> usize {
        self.endpoint.sessions.load(Ordering::Acquire)
    }

    /// Withdraws the announcement, stops both listeners, and closes every
    /// open connection. The manager is left running.
    ///
    /// # Errors
    ///
    /// Returns the withdrawal error, after shutting down regardless.
    pub fn shutdown(&self) -> Result<()> {
        let withdrawn = self
            .announce
            .as_ref()
            .map_or(Ok(()), |announce| announce.withdraw(&self.node));
        self.attach.stop();
        self.endpoint.attach_conns.close_all();
        self.rpc.shutdown();
        tracing::info!(addr = %self.node.addr, "service stopped");
        withdrawn
    }
}

/// Admits an attach connection if a session slot is free.
fn admit(endpoint: &Arc<Endpoint>, mut conn: TcpStream, peer: SocketAddr) {
    let limit = endpoint.options.attach_session_limit;
    if endpoint.sessions.fetch_add(1, Ordering::AcqRel) >= limit {
        let _ = endpoint.sessions.fetch_sub(1, Ordering::AcqRel);
        tracing::warn!(peer = %peer, limit, "attach session limit reached");
        reject(&mut conn, "resource exhausted");
        return;
    }
    let token = match endpoint.attach_conns.track(&conn) {
        Ok(token) => token,
        Err(e) => {
            let _ = endpoint.sessions.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(peer = %peer, error = %e, "dropping attach connection");
            return;
        }
    };

    let session = Arc::clone(endpoint);
    let spawned = std::thread::Builder::new()
        .name(format!("attach-{peer}"))
        .spawn(move || {
            session.attach_session(conn, peer);
            session.attach_conns.forget(token);
            let _ = session.sessions.fetch_sub(1, Ordering::AcqRel);
        });
    if let Err(e) = spawned {
        tracing::warn!(peer = %peer, error = %e, "cannot run attach session");
        endpoint.attach_conns.forget(token);
        let _ = endpoint.sessions.fetch_sub(1, Ordering::AcqRel);
    }
}
