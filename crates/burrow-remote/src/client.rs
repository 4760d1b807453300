//! Multiplexed control channel client.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow_common::error::{BurrowError, Result};
use serde::de::DeserializeOwned;

use crate::wire::{Call, Outcome, Request, Response, read_frame, transport, write_frame};

/// Calls waiting for their response, keyed by request id.
#[derive(Debug, Default)]
struct Pending {
    calls: Mutex<HashMap<u64, Sender<Outcome>>>,
    alive: AtomicBool,
}

impl Pending {
    fn calls(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Sender<Outcome>>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One connection to a node's control channel.
///
/// Calls may be issued concurrently from many threads: requests are
/// written under a lock and a reader thread hands each response to the
/// call waiting for it, so a long call does not hold up short ones.
#[derive(Debug)]
pub struct RpcClient {
    addr: String,
    writer: Mutex<TcpStream>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    timeout: Option<Duration>,
}

impl RpcClient {
    /// Connects to `addr`. `timeout` bounds both the connection attempt
    /// and, by default, every call.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Transport`] if the node cannot be reached.
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = dial(addr, timeout)?;
        let _ = stream.set_nodelay(true);
        let reader = stream.try_clone().map_err(|e| transport(addr, e))?;

        let pending = Arc::new(Pending::default());
        pending.alive.store(true, Ordering::Release);
        let routes = Arc::clone(&pending);
        let peer = addr.to_string();
        let _ = std::thread::Builder::new()
            .name(format!("rpc-{addr}"))
            .spawn(move || route_responses(&peer, reader, &routes))
            .map_err(|e| transport(addr, e))?;

        tracing::debug!(addr, "control connection established");
        Ok(Self {
            addr: addr.to_string(),
            writer: Mutex::new(stream),
            pending,
            next_id: AtomicU64::new(1),
            timeout: Some(timeout),
        })
    }

    /// Address of the node.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns `false` once the connection has failed or been closed.
    pub fn is_alive(&self) -> bool {
        self.pending.alive.load(Ordering::Acquire)
    }

    /// Performs a call with the default deadline.
    ///
    /// # Errors
    ///
    /// Returns the remote error, or [`BurrowError::Transport`] if the
    /// connection fails or the deadline passes.
    pub fn call<T: DeserializeOwned>(&self, call: Call) -> Result<T> {
        self.call_with_deadline(call, self.timeout)
    }

    /// Performs a call, waiting at most `deadline` (forever if `None`) for
    /// the response. An abandoned call is not cancelled on the node.
    ///
    /// # Errors
    ///
    /// Returns the remote error, or [`BurrowError::Transport`] if the
    /// connection fails or the deadline passes.
    pub fn call_with_deadline<T: DeserializeOwned>(
        &self,
        call: Call,
        deadline: Option<Duration>,
    ) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let method = call.method();
        let (tx, rx) = mpsc::channel();
        {
            let mut calls = self.pending.calls();
            if !self.is_alive() {
                return Err(transport(&self.addr, "connection closed"));
            }
            let _ = calls.insert(id, tx);
        }

        let sent = {
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| BurrowError::lock_poisoned("rpc writer"))?;
            write_frame(&mut *writer, &Request { id, call })
        };
        if let Err(e) = sent {
            let _ = self.pending.calls().remove(&id);
            self.close();
            return Err(transport(&self.addr, e));
        }
        tracing::trace!(addr = %self.addr, id, method, "call sent");

        let received = match deadline {
            Some(deadline) => rx.recv_timeout(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(outcome) => outcome.into_result(),
            Err(RecvTimeoutError::Timeout) => {
                let _ = self.pending.calls().remove(&id);
                tracing::debug!(addr = %self.addr, id, method, "call deadline exceeded");
                Err(transport(&self.addr, format!("{method}: deadline exceeded")))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(transport(&self.addr, format!("{method}: connection closed")))
            }
        }
    }

    /// Closes the connection; pending calls fail with a transport error.
    pub fn close(&self) {
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let mut last = None;
    for candidate in addr.to_socket_addrs().map_err(|e| transport(addr, e))? {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(match last {
        Some(e) => transport(addr, e),
        None => transport(addr, "address resolved to nothing"),
    })
}

fn route_responses(addr: &str, stream: TcpStream, pending: &Pending) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame::<_, Response>(&mut reader) {
            Ok(Some(response)) => {
                if let Some(waiter) = pending.calls().remove(&response.id) {
                    let _ = waiter.send(response.outcome);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(addr, error = %e, "control connection lost");
                break;
            }
        }
    }
    let mut calls = pending.calls();
    pending.alive.store(false, Ordering::Release);
    calls.clear();
}
