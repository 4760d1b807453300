//! Threaded control channel server.
//!
//! One accept thread per listener, one reader thread per connection, and
//! one worker thread per request, so a blocking call such as a task wait
//! never holds up the rest of the connection.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use burrow_common::error::{BurrowError, Result};
use serde_json::Value;

use crate::wire::{Call, Outcome, Request, Response, read_frame, write_frame};

/// How long the accept loop sleeps when no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Serves decoded calls.
pub trait Handler: Send + Sync + 'static {
    /// Performs one call and returns its JSON result.
    ///
    /// # Errors
    ///
    /// Returns the error reported back to the caller.
    fn handle(&self, call: Call) -> Result<Value>;
}

/// Live connections of one listener, closed together on shutdown.
#[derive(Debug, Default)]
pub(crate) struct Connections {
    open: Mutex<HashMap<u64, TcpStream>>,
    next: AtomicU64,
}

impl Connections {
    fn open(&self) -> MutexGuard<'_, HashMap<u64, TcpStream>> {
        match self.open.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Tracks a connection until [`Connections::forget`].
    pub(crate) fn track(&self, stream: &TcpStream) -> io::Result<u64> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let _ = self.open().insert(id, stream.try_clone()?);
        Ok(id)
    }

    pub(crate) fn forget(&self, id: u64) {
        let _ = self.open().remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.open().len()
    }

    /// Shuts every tracked connection down, unblocking its threads.
    pub(crate) fn close_all(&self) {
        for (_, stream) in self.open().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// A listener served by a background accept thread until stopped.
#[derive(Debug)]
pub(crate) struct Acceptor {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    /// Starts accepting on `listener`, handing each connection to
    /// `on_conn` on the accept thread.
    pub(crate) fn spawn<F>(name: &str, listener: TcpListener, stop: Arc<AtomicBool>, mut on_conn: F) -> Result<Self>
    where
        F: FnMut(TcpStream, SocketAddr) + Send + 'static,
    {
        let local_addr = listener
            .local_addr()
            .map_err(|e| BurrowError::io(name, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| BurrowError::io(name, e))?;
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name(format!("{name}-accept"))
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nonblocking(false) {
                                tracing::warn!(peer = %peer, error = %e, "dropping connection");
                                continue;
                            }
                            on_conn(stream, peer);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            std::thread::sleep(ACCEPT_POLL);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            std::thread::sleep(ACCEPT_POLL);
                        }
                    }
                }
            })
            .map_err(|e| BurrowError::io(name, e))?;
        Ok(Self {
            local_addr,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and waits for the accept thread to exit.
    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let handle = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Control channel server for a [`Handler`].
#[derive(Debug)]
pub struct RpcServer {
    acceptor: Acceptor,
    conns: Arc<Connections>,
}

impl RpcServer {
    /// Starts serving `handler` on `listener`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be configured or the accept
    /// thread cannot be started.
    pub fn serve(listener: TcpListener, handler: Arc<dyn Handler>) -> Result<Self> {
        let conns = Arc::new(Connections::default());
        let tracked = Arc::clone(&conns);
        let acceptor = Acceptor::spawn(
            "rpc",
            listener,
            Arc::new(AtomicBool::new(false)),
            move |stream, peer| {
                let token = match tracked.track(&stream) {
                    Ok(token) => token,
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "dropping connection");
                        return;
                    }
                };
                let handler = Arc::clone(&handler);
                let conns = Arc::clone(&tracked);
                let spawned = std::thread::Builder::new()
                    .name(format!("rpc-{peer}"))
                    .spawn(move || {
                        serve_connection(stream, peer, handler.as_ref());
                        conns.forget(token);
                    });
                if let Err(e) = spawned {
                    tracing::warn!(peer = %peer, error = %e, "cannot serve connection");
                    tracked.forget(token);
                }
            },
        )?;
        tracing::info!(addr = %acceptor.local_addr(), "control channel listening");
        Ok(Self { acceptor, conns })
    }

    /// Address the server is bound to.
    pub const fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Number of open connections.
    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    /// Stops accepting and closes every connection. Calls still running
    /// finish, but their responses are dropped.
    pub fn shutdown(&self) {
        self.acceptor.stop();
        self.conns.close_all();
        tracing::info!(addr = %self.local_addr(), "control channel closed");
    }
}

fn serve_connection(stream: TcpStream, peer: SocketAddr, handler: &dyn Handler) {
    let writer = match stream.try_clone() {
        Ok(writer) => Arc::new(Mutex::new(writer)),
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "dropping connection");
            return;
        }
    };
    tracing::debug!(peer = %peer, "control connection accepted");

    let mut reader = BufReader::new(stream);
    std::thread::scope(|scope| {
        loop {
            let request = match read_frame::<_, Request>(&mut reader) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    if e.kind() == io::ErrorKind::InvalidData {
                        tracing::warn!(peer = %peer, error = %e, "malformed request, closing");
                    }
                    break;
                }
            };
            let writer = Arc::clone(&writer);
            let spawned = std::thread::Builder::new().spawn_scoped(scope, move || {
                let id = request.id;
                let method = request.call.method();
                let result = handler.handle(request.call);
                if let Err(e) = &result {
                    tracing::debug!(peer = %peer, id, method, error = %e, "call failed");
                }
                let response = Response {
                    id,
                    outcome: Outcome::from_result(result),
                };
                let written = match writer.lock() {
                    Ok(mut stream) => write_frame(&mut *stream, &response),
                    Err(_) => Err(io::Error::other("writer lock poisoned")),
                };
                if let Err(e) = written {
                    tracing::debug!(peer = %peer, id, error = %e, "response dropped");
                }
            });
            if let Err(e) = spawned {
                tracing::warn!(peer = %peer, error = %e, "cannot run call, closing");
                break;
            }
        }
    });

    tracing::debug!(peer = %peer, "control connection closed");
}
