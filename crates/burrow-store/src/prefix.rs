//! Key-prefix view over another store.

use std::sync::Arc;

use burrow_common::error::{BurrowError, Result};

use crate::{EntryVisitor, Store};

/// A [`Store`] that scopes every key under `<prefix>/` of an inner store.
///
/// Keys seen through the view have the prefix stripped. The sequence
/// counter is shared with the inner store.
#[derive(Clone)]
pub struct PrefixStore {
    inner: Arc<dyn Store>,
    prefix: String,
}

impl std::fmt::Debug for PrefixStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl PrefixStore {
    /// Creates a view of `inner` under `prefix`.
    pub fn new(inner: Arc<dyn Store>, prefix: &str) -> Self {
        Self {
            inner,
            prefix: format!("{}/", prefix.trim_end_matches('/')),
        }
    }

    fn full(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn unscope(&self, err: BurrowError) -> BurrowError {
        match err {
            BurrowError::NotFound { kind, id } => BurrowError::NotFound {
                kind,
                id: id.strip_prefix(&self.prefix).unwrap_or(&id).to_string(),
            },
            BurrowError::StaleWrite { key } => BurrowError::StaleWrite {
                key: key.strip_prefix(&self.prefix).unwrap_or(&key).to_string(),
            },
            other => other,
        }
    }
}

impl Store for PrefixStore {
    fn get(&self, key: &str) -> Result<(u64, Vec<u8>)> {
        self.inner
            .get(&self.full(key))
            .map_err(|e| self.unscope(e))
    }

    fn put(&self, key: &str, version: u64, value: &[u8]) -> Result<u64> {
        self.inner
            .put(&self.full(key), version, value)
            .map_err(|e| self.unscope(e))
    }

    fn delete(&self, key: &str, version: u64) -> Result<()> {
        self.inner
            .delete(&self.full(key), version)
            .map_err(|e| self.unscope(e))
    }

    fn list(&self, prefix: &str, visit: &mut EntryVisitor<'_>) -> Result<()> {
        let strip = self.prefix.len();
        self.inner.list(&self.full(prefix), &mut |key, version, value| {
            visit(&key[strip..], version, value)
        })
    }

    fn next_sequence(&self) -> Result<u64> {
        self.inner.next_sequence()
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JsonStore;

    #[test]
    fn keys_are_scoped_and_stripped() {
        let inner: Arc<dyn Store> = Arc::new(JsonStore::memory());
        let nodes = PrefixStore::new(Arc::clone(&inner), "nodes");
        let _ = nodes.put("n1", 0, b"addr").unwrap();
        assert_eq!(inner.get("nodes/n1").unwrap().1, b"addr");

        let mut keys = Vec::new();
        nodes
            .list("", &mut |key, _, _| {
                keys.push(key.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(keys, vec!["n1"]);
    }

    #[test]
    fn not_found_reports_unprefixed_key() {
        let inner: Arc<dyn Store> = Arc::new(JsonStore::memory());
        let view = PrefixStore::new(inner, "cntr/");
        let err = view.get("missing").unwrap_err();
        assert!(matches!(err, BurrowError::NotFound { ref id, .. } if id == "missing"));
    }
}
