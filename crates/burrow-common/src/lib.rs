//! # burrow-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire Burrow workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the data model every node and client
//! exchanges: container and task descriptions, the declarative container
//! template, and the error taxonomy that survives a network hop.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod meta;
pub mod types;
