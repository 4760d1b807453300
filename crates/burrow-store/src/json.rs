//! Embedded store persisted as a single JSON document.
//!
//! The whole map lives in memory behind one mutex. Every mutation is
//! applied to a copy, written to `<file>.tmp`, and renamed over the
//! original, so the file on disk is always a complete snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use burrow_common::error::{BurrowError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{EntryVisitor, Store};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    sequence: u64,
    entries: BTreeMap<String, Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    version: u64,
    #[serde(serialize_with = "encode_value", deserialize_with = "decode_value")]
    value: Vec<u8>,
}

fn encode_value<S: Serializer>(value: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(value))
}

fn decode_value<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded)
        .map_err(serde::de::Error::custom)
}

/// File-backed [`Store`] for a single node.
#[derive(Debug)]
pub struct JsonStore {
    path: Option<PathBuf>,
    state: Mutex<Snapshot>,
}

impl JsonStore {
    /// Opens the store at `path`, creating an empty one if the file does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// its directory cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        let snapshot = if path.exists() {
            let raw = std::fs::read(path).map_err(|e| BurrowError::io(path, e))?;
            serde_json::from_slice(&raw)?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| BurrowError::io(parent, e))?;
            }
            Snapshot::default()
        };
        tracing::debug!(
            path = %path.display(),
            entries = snapshot.entries.len(),
            "store opened"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(snapshot),
        })
    }

    /// Creates a store that is never written to disk.
    pub fn memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(Snapshot::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Snapshot>> {
        self.state
            .lock()
            .map_err(|_| BurrowError::lock_poisoned("store"))
    }

    /// Applies `change` to a copy of the state, persists it, and only then
    /// publishes it.
    fn mutate<T>(&self, change: impl FnOnce(&mut Snapshot) -> Result<T>) -> Result<T> {
        let mut state = self.lock()?;
        let mut next = state.clone();
        let out = change(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec(snapshot)?;
        std::fs::write(&tmp, raw).map_err(|e| BurrowError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| BurrowError::io(path, e))
    }
}

impl Store for JsonStore {
    fn get(&self, key: &str) -> Result<(u64, Vec<u8>)> {
        let state = self.lock()?;
        state
            .entries
            .get(key)
            .map(|entry| (entry.version, entry.value.clone()))
            .ok_or_else(|| BurrowError::NotFound {
                kind: "key",
                id: key.to_string(),
            })
    }

    fn put(&self, key: &str, version: u64, value: &[u8]) -> Result<u64> {
        self.mutate(|state| {
            let current = state.entries.get(key).map_or(0, |entry| entry.version);
            if current != version {
                return Err(BurrowError::StaleWrite {
                    key: key.to_string(),
                });
            }
            let next = current + 1;
            let _ = state.entries.insert(
                key.to_string(),
                Entry {
                    version: next,
                    value: value.to_vec(),
                },
            );
            Ok(next)
        })
    }

    fn delete(&self, key: &str, version: u64) -> Result<()> {
        self.mutate(|state| {
            let current = state
                .entries
                .get(key)
                .ok_or_else(|| BurrowError::NotFound {
                    kind: "key",
                    id: key.to_string(),
                })?
                .version;
            if current != version {
                return Err(BurrowError::StaleWrite {
                    key: key.to_string(),
                });
            }
            let _ = state.entries.remove(key);
            Ok(())
        })
    }

    fn list(&self, prefix: &str, visit: &mut EntryVisitor<'_>) -> Result<()> {
        let matching: Vec<(String, u64, Vec<u8>)> = {
            let state = self.lock()?;
            state
                .entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| (key.clone(), entry.version, entry.value.clone()))
                .collect()
        };
        for (key, version, value) in &matching {
            visit(key, *version, value)?;
        }
        Ok(())
    }

    fn next_sequence(&self) -> Result<u64> {
        self.mutate(|state| {
            state.sequence += 1;
            Ok(state.sequence)
        })
    }

    fn close(&self) -> Result<()> {
        let state = self.lock()?;
        self.persist(&state)?;
        tracing::debug!("store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_requires_matching_version() {
        let store = JsonStore::memory();
        assert_eq!(store.put("a", 0, b"one").unwrap(), 1);
        assert!(matches!(
            store.put("a", 0, b"two"),
            Err(BurrowError::StaleWrite { .. })
        ));
        assert_eq!(store.put("a", 1, b"two").unwrap(), 2);
        assert_eq!(store.get("a").unwrap(), (2, b"two".to_vec()));
    }

    #[test]
    fn put_on_absent_key_requires_version_zero() {
        let store = JsonStore::memory();
        assert!(matches!(
            store.put("fresh", 3, b"x"),
            Err(BurrowError::StaleWrite { .. })
        ));
        assert!(store.get("fresh").unwrap_err().is_not_found());
    }

    #[test]
    fn delete_checks_version_and_presence() {
        let store = JsonStore::memory();
        let v = store.put("k", 0, b"v").unwrap();
        assert!(matches!(
            store.delete("k", v + 1),
            Err(BurrowError::StaleWrite { .. })
        ));
        store.delete("k", v).unwrap();
        assert!(store.delete("k", v).unwrap_err().is_not_found());
    }

    #[test]
    fn list_filters_by_prefix_in_order() {
        let store = JsonStore::memory();
        for key in ["cntr/b", "cntr/a", "nodes/x", "cntrz"] {
            let _ = store.put(key, 0, key.as_bytes()).unwrap();
        }
        let mut seen = Vec::new();
        store
            .list("cntr/", &mut |key, _, _| {
                seen.push(key.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["cntr/a", "cntr/b"]);
    }

    #[test]
    fn list_visitor_error_stops_walk() {
        let store = JsonStore::memory();
        let _ = store.put("p/1", 0, b"").unwrap();
        let _ = store.put("p/2", 0, b"").unwrap();
        let mut calls = 0;
        let err = store
            .list("p/", &mut |_, _, _| {
                calls += 1;
                Err(BurrowError::ResourceExhausted {
                    message: "stop".into(),
                })
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, BurrowError::ResourceExhausted { .. }));
    }

    #[test]
    fn sequence_is_monotonic() {
        let store = JsonStore::memory();
        let a = store.next_sequence().unwrap();
        let b = store.next_sequence().unwrap();
        assert!(b > a);
    }

    #[test]
    fn reopen_restores_entries_and_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("store.json");
        {
            let store = JsonStore::open(&path).expect("open");
            let _ = store.put("bin", 0, &[0, 159, 146, 150]).unwrap();
            let _ = store.next_sequence().unwrap();
            store.close().unwrap();
        }
        let store = JsonStore::open(&path).expect("reopen");
        assert_eq!(store.get("bin").unwrap(), (1, vec![0, 159, 146, 150]));
        assert_eq!(store.next_sequence().unwrap(), 2);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonStore::open(&path),
            Err(BurrowError::Serialization { .. })
        ));
    }
}
