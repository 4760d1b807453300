//! # burrow-remote
//!
//! Serves a node's containers over the network and reaches them again
//! from clients.
//!
//! - [`wire`]: newline-delimited JSON frames for the control channel.
//! - [`RpcClient`] / [`RpcServer`]: a multiplexed client and a threaded
//!   server for that channel.
//! - [`CntrService`]: a [`burrow_runtime::Manager`] served on a control
//!   listener plus an attach listener that hands raw connections to task
//!   stdio after a token handshake.
//! - [`CntrProxy`]: the same `Manager` surface on the client side, for
//!   one peer or a whole cluster.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod client;
pub mod proxy;
pub mod server;
pub mod service;
pub mod splice;
pub mod token;
pub mod wire;

pub use client::RpcClient;
pub use proxy::{CntrProxy, ProxyOptions};
pub use server::{Handler, RpcServer};
pub use service::{CntrService, ServiceOptions};
pub use token::TokenCache;
