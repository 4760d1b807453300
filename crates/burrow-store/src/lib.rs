//! # burrow-store
//!
//! Storage contracts shared by every node and client.
//!
//! - [`Store`]: a versioned key-value store with optimistic concurrency.
//!   [`JsonStore`] is the embedded implementation; [`PrefixStore`] scopes
//!   any store under a key prefix.
//! - [`registry`]: the placement registry (container id to node) and node
//!   discovery, backed either by a [`Store`] or by a Consul agent.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod json;
mod prefix;
pub mod registry;

use burrow_common::error::{BurrowError, Result};

pub use json::JsonStore;
pub use prefix::PrefixStore;

/// Visitor over store entries: key, version, value.
pub type EntryVisitor<'a> = dyn FnMut(&str, u64, &[u8]) -> Result<()> + 'a;

/// Versioned key-value store.
///
/// Every key carries a version. Writes must present the version they read
/// (zero for a key that does not exist yet); a mismatch fails with
/// [`BurrowError::StaleWrite`] and nothing is written. Each operation is
/// atomic on its own; there are no multi-key transactions.
pub trait Store: Send + Sync {
    /// Reads a key, returning its version and value.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::NotFound`] if the key does not exist.
    fn get(&self, key: &str) -> Result<(u64, Vec<u8>)>;

    /// Writes a key if its current version equals `version`, returning the
    /// new version.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::StaleWrite`] on a version mismatch.
    fn put(&self, key: &str, version: u64, value: &[u8]) -> Result<u64>;

    /// Deletes a key if its current version equals `version`.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::NotFound`] if the key does not exist and
    /// [`BurrowError::StaleWrite`] on a version mismatch.
    fn delete(&self, key: &str, version: u64) -> Result<()>;

    /// Visits every entry whose key starts with `prefix`, in key order.
    ///
    /// The visitor sees a snapshot; it may call back into the store. An
    /// error from the visitor stops the walk and is returned.
    ///
    /// # Errors
    ///
    /// Returns the visitor's error or a storage failure.
    fn list(&self, prefix: &str, visit: &mut EntryVisitor<'_>) -> Result<()>;

    /// Returns the next value of the store-wide monotonic counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be persisted.
    fn next_sequence(&self) -> Result<u64>;

    /// Flushes and releases the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    fn close(&self) -> Result<()>;
}

/// Returns the value under `key`, storing `default` first if the key is
/// absent. Concurrent callers all observe the same winning value.
///
/// # Errors
///
/// Returns any storage error other than the race this resolves.
pub fn load_or_store(store: &dyn Store, key: &str, default: &[u8]) -> Result<Vec<u8>> {
    match store.get(key) {
        Ok((_, value)) => return Ok(value),
        Err(BurrowError::NotFound { .. }) => {}
        Err(e) => return Err(e),
    }
    match store.put(key, 0, default) {
        Ok(_) => Ok(default.to_vec()),
        Err(BurrowError::StaleWrite { .. }) => store.get(key).map(|(_, value)| value),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_store_keeps_first_value() {
        let store = JsonStore::memory();
        let first = load_or_store(&store, "id", b"alpha").unwrap();
        let second = load_or_store(&store, "id", b"beta").unwrap();
        assert_eq!(first, b"alpha");
        assert_eq!(second, b"alpha");
    }
}
