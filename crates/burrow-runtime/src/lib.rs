//! Node-local container runtime for Burrow.
//!
//! A [`CntrManager`] creates containers from a template through a
//! [`backend::Runtime`], keeps the live ones in memory, and persists their
//! descriptions in a [`burrow_store::Store`]. Each [`LocalCntr`] runs
//! tasks whose stdio is reachable through an [`Attacher`].
//!
//! The [`Cntr`] and [`Manager`] traits are the surface the network layer
//! serves and that remote proxies implement again on the client side.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod attach;
pub mod backend;
pub mod baseline;
pub mod cntr;
pub mod container;
pub mod manager;
pub mod query;
pub mod task;

pub use attach::Attacher;
pub use backend::{HostRuntime, NamespaceRuntime, Runtime};
pub use cntr::{Cntr, CntrVisitor, Manager, TaskVisitor};
pub use container::LocalCntr;
pub use manager::{CntrManager, ManagerOptions};
pub use query::Query;
