//! The node-local container manager.
//!
//! Container ids are `<node-id>,<sequence>`: the node id is generated once
//! and kept in the store, the sequence is the store's counter. Each
//! container's description and assembled configuration are persisted
//! under `cntr/<id>`. Live containers only exist in memory, so records
//! left behind by an earlier run of this node are removed on open.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use burrow_common::constants::{CNTR_PREFIX, ID_SEPARATOR, NODE_ID_KEY, ROOTFS_DIR};
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{CntrSpec, Cntrinfo, compose_id, split_id};
use burrow_store::{PrefixStore, Store, load_or_store};
use serde::{Deserialize, Serialize};

use crate::backend::Runtime;
use crate::baseline::{BaselineOptions, RuntimeConfig, assemble};
use crate::cntr::{Cntr, CntrVisitor, Manager};
use crate::container::LocalCntr;
use crate::query::Query;

/// Settings for a [`CntrManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Node data directory; relative rootfs paths resolve under its
    /// `rootfs` subdirectory.
    pub data_dir: PathBuf,
    /// Whether the node runs without root.
    pub rootless: bool,
}

/// What is persisted per container.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CntrRecord {
    info: Cntrinfo,
    config: RuntimeConfig,
}

/// [`Manager`] owning the containers of this node.
pub struct CntrManager {
    id: String,
    rootfs_dir: PathBuf,
    baseline: BaselineOptions,
    records: PrefixStore,
    runtime: Box<dyn Runtime>,
    cntrs: RwLock<HashMap<String, Arc<LocalCntr>>>,
}

impl std::fmt::Debug for CntrManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CntrManager")
            .field("id", &self.id)
            .field("rootfs_dir", &self.rootfs_dir)
            .finish_non_exhaustive()
    }
}

impl CntrManager {
    /// Opens the manager over `store`, loading or creating the node
    /// identity and removing this node's stale records.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or an I/O error if the rootfs directory
    /// cannot be created.
    pub fn open(store: Arc<dyn Store>, runtime: Box<dyn Runtime>, options: ManagerOptions) -> Result<Self> {
        let fresh = uuid::Uuid::new_v4().simple().to_string();
        let raw = load_or_store(store.as_ref(), NODE_ID_KEY, fresh.as_bytes())?;
        let id = String::from_utf8(raw).map_err(|_| BurrowError::Internal {
            message: "stored node id is not UTF-8".into(),
        })?;

        let rootfs_dir = options.data_dir.join(ROOTFS_DIR);
        std::fs::create_dir_all(&rootfs_dir).map_err(|e| BurrowError::io(&rootfs_dir, e))?;

        let manager = Self {
            id,
            rootfs_dir,
            baseline: BaselineOptions::current(options.rootless),
            records: PrefixStore::new(store, CNTR_PREFIX),
            runtime,
            cntrs: RwLock::new(HashMap::new()),
        };
        let purged = manager.purge_stale()?;
        tracing::info!(node = %manager.id, purged, rootless = options.rootless, "container manager opened");
        Ok(manager)
    }

    /// This node's identity.
    pub fn node_id(&self) -> &str {
        &self.id
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Arc<LocalCntr>>>> {
        self.cntrs
            .read()
            .map_err(|_| BurrowError::lock_poisoned("container table"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Arc<LocalCntr>>>> {
        self.cntrs
            .write()
            .map_err(|_| BurrowError::lock_poisoned("container table"))
    }

    fn lookup(&self, id: &str) -> Result<Arc<LocalCntr>> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or_else(|| BurrowError::NotFound {
                kind: "container",
                id: id.to_string(),
            })
    }

    fn purge_stale(&self) -> Result<usize> {
        let mut stale = Vec::new();
        let own = format!("{}{ID_SEPARATOR}", self.id);
        self.records.list(&own, &mut |key, version, _| {
            stale.push((key.to_string(), version));
            Ok(())
        })?;
        for (key, version) in &stale {
            match self.records.delete(key, *version) {
                Ok(()) | Err(BurrowError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(stale.len())
    }

    fn forget_record(&self, id: &str) -> Result<()> {
        match self.records.get(id) {
            Ok((version, _)) => match self.records.delete(id, version) {
                Ok(()) | Err(BurrowError::NotFound { .. }) => Ok(()),
                Err(e) => Err(e),
            },
            Err(BurrowError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn resolve_rootfs(&self, rootfs: &str) -> Result<PathBuf> {
        if rootfs.is_empty() {
            return Err(BurrowError::InvalidArgument {
                message: "rootfs must be set".into(),
            });
        }
        let path = Path::new(rootfs);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.rootfs_dir.join(path)
        };
        if !resolved.is_dir() {
            return Err(BurrowError::InvalidArgument {
                message: format!("rootfs {} is not a directory", resolved.display()),
            });
        }
        Ok(resolved)
    }
}

/// Orders ids by their numeric sequence.
fn sequence_of(id: &str) -> u64 {
    split_id(id)
        .and_then(|(_, seq)| seq.parse().ok())
        .unwrap_or(u64::MAX)
}

impl Manager for CntrManager {
    fn id(&self) -> Result<String> {
        Ok(self.id.clone())
    }

    fn create(&self, spec: &CntrSpec) -> Result<String> {
        let rootfs = self.resolve_rootfs(&spec.rootfs)?;
        let id = compose_id(&self.id, self.records.next_sequence()?);
        let config = assemble(&spec.meta, &rootfs, &self.baseline);
        let info = Cntrinfo {
            id: id.clone(),
            rootfs: rootfs.display().to_string(),
            tags: spec.tags.clone(),
            meta: spec.meta.with_defaults(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let record = CntrRecord {
            info: info.clone(),
            config: config.clone(),
        };
        let _ = self.records.put(&id, 0, &serde_json::to_vec(&record)?)?;

        let runtime = match self.runtime.create(&id, &config) {
            Ok(runtime) => runtime,
            Err(e) => {
                if let Err(cleanup) = self.forget_record(&id) {
                    tracing::warn!(id = %id, error = %cleanup, "cannot remove record of failed container");
                }
                return Err(e);
            }
        };
        let cntr = Arc::new(LocalCntr::new(info, config, runtime));
        let _ = self.write()?.insert(id.clone(), cntr);
        tracing::info!(id = %id, rootfs = %rootfs.display(), "container created");
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Arc<dyn Cntr>> {
        let cntr: Arc<dyn Cntr> = self.lookup(id)?;
        Ok(cntr)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let cntr = self.lookup(id)?;
        cntr.destroy()?;
        let _ = self.write()?.remove(id);
        self.forget_record(id)?;
        tracing::info!(id, "container deleted");
        Ok(())
    }

    fn list(&self, query: &str, visit: &mut CntrVisitor<'_>) -> Result<()> {
        let query = Query::parse(query)?;
        if query.node().is_some_and(|node| node != self.id) {
            return Ok(());
        }
        let mut cntrs: Vec<Arc<LocalCntr>> = self.read()?.values().cloned().collect();
        cntrs.sort_by_cached_key(|cntr| sequence_of(&cntr.id()));
        for cntr in cntrs {
            let info = cntr.meta()?;
            if query.matches(&info) {
                visit(&info)?;
            }
        }
        Ok(())
    }

    fn update_tags(&self, id: &str, tags: Vec<String>) -> Result<()> {
        let cntr = self.lookup(id)?;
        let (version, raw) = self.records.get(id)?;
        let mut record: CntrRecord = serde_json::from_slice(&raw)?;
        record.info.tags.clone_from(&tags);
        let _ = self.records.put(id, version, &serde_json::to_vec(&record)?)?;
        cntr.set_tags(tags);
        tracing::debug!(id, "tags updated");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let cntrs: Vec<Arc<LocalCntr>> = self.write()?.drain().map(|(_, cntr)| cntr).collect();
        let mut last = None;
        for cntr in &cntrs {
            if let Err(e) = cntr.destroy() {
                tracing::warn!(id = %cntr.id(), error = %e, "cannot destroy container");
                last = Some(e);
            }
        }
        tracing::info!(node = %self.id, count = cntrs.len(), "container manager closed");
        last.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostRuntime, RuntimeContainer};
    use burrow_common::types::Taskinfo;
    use burrow_store::JsonStore;

    struct FailingRuntime;

    impl Runtime for FailingRuntime {
        fn create(&self, _id: &str, _config: &RuntimeConfig) -> Result<Box<dyn RuntimeContainer>> {
            Err(BurrowError::Runtime {
                message: "no namespaces here".into(),
            })
        }
    }

    fn open(store: &Arc<dyn Store>, data: &Path) -> CntrManager {
        CntrManager::open(
            Arc::clone(store),
            Box::new(HostRuntime::new()),
            ManagerOptions {
                data_dir: data.to_path_buf(),
                rootless: true,
            },
        )
        .expect("open")
    }

    fn spec(rootfs: &str, tags: &[&str]) -> CntrSpec {
        CntrSpec {
            rootfs: rootfs.into(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            ..CntrSpec::default()
        }
    }

    fn ids(manager: &CntrManager, query: &str) -> Vec<String> {
        let mut out = Vec::new();
        manager
            .list(query, &mut |info| {
                out.push(info.id.clone());
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn ids_carry_node_identity_and_sequence() {
        let data = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn Store> = Arc::new(JsonStore::memory());
        let manager = open(&store, data.path());
        let a = manager.create(&spec("/", &[])).unwrap();
        let b = manager.create(&spec("/", &[])).unwrap();
        assert_ne!(a, b);
        assert_eq!(split_id(&a).unwrap().0, manager.node_id());
        assert!(sequence_of(&a) < sequence_of(&b));
        assert_eq!(Manager::id(&manager).unwrap(), manager.node_id());
        manager.close().unwrap();
    }

    #[test]
    fn relative_rootfs_resolves_under_data_dir() {
        let data = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(data.path().join("rootfs/alpine")).unwrap();
        let store: Arc<dyn Store> = Arc::new(JsonStore::memory());
        let manager = open(&store, data.path());
        let id = manager.create(&spec("alpine", &[])).unwrap();
        let info = manager.get(&id).unwrap().meta().unwrap();
        assert_eq!(Path::new(&info.rootfs), data.path().join("rootfs/alpine"));
        assert!(matches!(
            manager.create(&spec("missing", &[])),
            Err(BurrowError::InvalidArgument { .. })
        ));
        assert!(matches!(
            manager.create(&spec("", &[])),
            Err(BurrowError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn list_filters_and_honours_node_scope() {
        let data = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn Store> = Arc::new(JsonStore::memory());
        let manager = open(&store, data.path());
        let web = manager.create(&spec("/", &["web"])).unwrap();
        let db = manager.create(&spec("/", &["db"])).unwrap();
        assert_eq!(ids(&manager, ""), vec![web.clone(), db.clone()]);
        assert_eq!(ids(&manager, "tags=web"), vec![web.clone()]);
        assert_eq!(
            ids(&manager, &format!("{},tags=db", manager.node_id())),
            vec![db]
        );
        assert!(ids(&manager, "someone-else,tags=web").is_empty());
        assert!(manager.list("tags=", &mut |_| Ok(())).is_err());
    }

    #[test]
    fn update_tags_persists_and_reports() {
        let data = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn Store> = Arc::new(JsonStore::memory());
        let manager = open(&store, data.path());
        let id = manager.create(&spec("/", &["old"])).unwrap();
        manager.update_tags(&id, vec!["new".into()]).unwrap();
        assert_eq!(manager.get(&id).unwrap().meta().unwrap().tags, vec!["new"]);
        let (version, raw) = store.get(&format!("cntr/{id}")).unwrap();
        let record: CntrRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(version, 2);
        assert_eq!(record.info.tags, vec!["new"]);
        assert!(manager.update_tags("nobody,1", Vec::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_forgets_container_and_record() {
        let data = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn Store> = Arc::new(JsonStore::memory());
        let manager = open(&store, data.path());
        let id = manager.create(&spec("/", &[])).unwrap();
        let cntr = manager.get(&id).unwrap();
        let _ = cntr.start(&Taskinfo::command(["sleep", "30"])).unwrap();
        manager.delete(&id).unwrap();
        assert!(manager.get(&id).err().unwrap().is_not_found());
        assert!(store.get(&format!("cntr/{id}")).unwrap_err().is_not_found());
        assert!(manager.delete(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn failed_materialization_leaves_no_record() {
        let data = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn Store> = Arc::new(JsonStore::memory());
        let manager = CntrManager::open(
            Arc::clone(&store),
            Box::new(FailingRuntime),
            ManagerOptions {
                data_dir: data.path().to_path_buf(),
                rootless: true,
            },
        )
        .unwrap();
        assert!(manager.create(&spec("/", &[])).is_err());
        let mut records = 0;
        store
            .list("cntr/", &mut |_, _, _| {
                records += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(records, 0);
    }

    #[test]
    fn reopen_keeps_identity_and_purges_own_records() {
        let data = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn Store> = Arc::new(JsonStore::memory());
        let _ = store.put("cntr/other-node,1", 0, b"{}").unwrap();
        let node = {
            let manager = open(&store, data.path());
            let _ = manager.create(&spec("/", &[])).unwrap();
            manager.node_id().to_string()
        };
        let manager = open(&store, data.path());
        assert_eq!(manager.node_id(), node);
        assert!(ids(&manager, "").is_empty());
        let mut keys = Vec::new();
        store
            .list("cntr/", &mut |key, _, _| {
                keys.push(key.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(keys, vec!["cntr/other-node,1"]);
    }
}
