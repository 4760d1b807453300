//! Namespace-isolated backend.
//!
//! The first task of a container unshares the configured namespaces,
//! forks into the new pid namespace, builds the mount tree under the
//! rootfs, and changes root into it. Later tasks open the namespace files
//! of a live task in the parent and `setns(2)` into them in the child.
//! Every task joins the container's cgroup before it does anything else.

use std::fs::File;
use std::io::Write as _;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use burrow_common::error::{BurrowError, Result};
use burrow_common::meta::{MaskKind, Namespace, ResourceLimits, Rlimit};
use burrow_core::cgroup::CgroupManager;
use burrow_core::filesystem::mount;
use burrow_core::namespace::{self, NamespaceFiles, uts};
use burrow_core::{capability, rlimit};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use super::{ProcessSpec, Runtime, RuntimeContainer, TaskStdio, spawn_error};
use crate::baseline::RuntimeConfig;

/// Attempts at removing a cgroup whose last processes are still exiting.
const CGROUP_REMOVE_ATTEMPTS: u32 = 20;

/// [`Runtime`] isolating containers with namespaces and cgroups v2.
#[derive(Debug, Clone)]
pub struct NamespaceRuntime {
    cgroup_root: PathBuf,
}

impl NamespaceRuntime {
    /// Creates the runtime, placing container cgroups under `cgroup_root`.
    #[must_use]
    pub fn new(cgroup_root: &Path) -> Self {
        Self {
            cgroup_root: cgroup_root.to_path_buf(),
        }
    }

    /// Creates the container cgroup. Without root and without limits to
    /// enforce, a missing cgroup only costs whole-container signalling.
    fn cgroup(&self, id: &str, config: &RuntimeConfig) -> Result<Option<CgroupManager>> {
        let wants_limits = config.resources != ResourceLimits::default();
        let created = CgroupManager::create(&self.cgroup_root, id)
            .and_then(|cgroup| cgroup.apply_limits(&config.resources).map(|()| cgroup));
        match created {
            Ok(cgroup) => Ok(Some(cgroup)),
            Err(e) if config.rootless || !wants_limits => {
                tracing::warn!(id, error = %e, "running container without a cgroup");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Runtime for NamespaceRuntime {
    fn create(&self, id: &str, config: &RuntimeConfig) -> Result<Box<dyn RuntimeContainer>> {
        capability::validate(&config.capabilities)?;
        rlimit::validate(&config.rlimits)?;
        if !config.rootfs.is_dir() {
            return Err(BurrowError::InvalidArgument {
                message: format!("rootfs {} is not a directory", config.rootfs.display()),
            });
        }
        let cgroup = self.cgroup(id, config)?;
        tracing::info!(
            id,
            rootfs = %config.rootfs.display(),
            namespaces = config.namespaces.len(),
            cgroup = cgroup.is_some(),
            "namespace container prepared"
        );
        Ok(Box::new(NamespaceContainer {
            id: id.to_string(),
            config: Arc::new(config.clone()),
            cgroup,
        }))
    }
}

#[derive(Debug)]
struct NamespaceContainer {
    id: String,
    config: Arc<RuntimeConfig>,
    cgroup: Option<CgroupManager>,
}

/// Everything the child needs, prepared in the parent.
struct ChildSetup {
    config: Arc<RuntimeConfig>,
    procs: Option<File>,
    join: Option<NamespaceFiles>,
    cwd: String,
    capabilities: Vec<String>,
    rlimits: Vec<Rlimit>,
}

impl ChildSetup {
    /// Runs between fork and exec.
    fn run(&self) -> std::io::Result<()> {
        if let Some(mut procs) = self.procs.as_ref() {
            procs.write_all(b"0")?;
        }
        match &self.join {
            None => {
                namespace::unshare_namespaces(
                    &self.config.namespaces,
                    &self.config.uid_map,
                    &self.config.gid_map,
                )?;
                namespace::fork_into_pid_namespace()?;
                if self.config.namespaces.contains(&Namespace::Mount) {
                    self.build_mounts()?;
                }
                if self.config.namespaces.contains(&Namespace::Uts) {
                    uts::set_hostname(&self.config.hostname)?;
                }
            }
            Some(files) => {
                files.join()?;
                namespace::fork_into_pid_namespace()?;
            }
        }
        mount::enter_root(&self.config.rootfs, &self.cwd)?;
        rlimit::apply(&self.rlimits)?;
        capability::restrict_to(&self.capabilities)
    }

    fn build_mounts(&self) -> std::io::Result<()> {
        let rootfs = &self.config.rootfs;
        mount::make_rprivate()?;
        if self.config.readonly_rootfs {
            mount::bind_self(rootfs)?;
        }
        for entry in &self.config.mounts {
            mount::mount_into(rootfs, entry)?;
        }
        for path in &self.config.masked_paths {
            mount::mask_path(rootfs, path, MaskKind::Hidden)?;
        }
        for path in &self.config.readonly_paths {
            mount::mask_path(rootfs, path, MaskKind::Read)?;
        }
        if self.config.readonly_rootfs {
            mount::remount_readonly(rootfs)?;
        }
        Ok(())
    }
}

impl NamespaceContainer {
    fn signal_all(&self, signal: Signal) -> Result<()> {
        let Some(cgroup) = &self.cgroup else {
            return Ok(());
        };
        for pid in cgroup.processes()? {
            if let Err(e) = kill(Pid::from_raw(pid), signal) {
                tracing::debug!(id = %self.id, pid, error = %e, "signal not delivered");
            }
        }
        Ok(())
    }
}

impl RuntimeContainer for NamespaceContainer {
    fn run(&self, process: &ProcessSpec, stdio: TaskStdio) -> Result<Child> {
        let (program, args) = process
            .args
            .split_first()
            .ok_or_else(|| BurrowError::InvalidArgument {
                message: "empty command".into(),
            })?;
        capability::validate(&process.capabilities)?;
        rlimit::validate(&process.rlimits)?;

        let procs = match &self.cgroup {
            Some(cgroup) => Some(cgroup.open_procs()?),
            None => None,
        };
        let join = match process.init_pid {
            Some(pid) => Some(NamespaceFiles::open(pid, &self.config.namespaces)?),
            None => None,
        };
        let setup = ChildSetup {
            config: Arc::clone(&self.config),
            procs,
            join,
            cwd: process.cwd.clone(),
            capabilities: process.capabilities.clone(),
            rlimits: process.rlimits.clone(),
        };

        let stdout = stdio
            .output
            .try_clone()
            .map_err(|e| spawn_error(&process.args, &e))?;
        let mut command = Command::new(program);
        let _ = command
            .args(args)
            .env_clear()
            .envs(process.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::from(stdio.stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stdio.output))
            .process_group(0);
        // SAFETY: the hook only makes system calls and touches state owned
        // by `setup`; it never locks anything shared with other threads.
        unsafe {
            let _ = command.pre_exec(move || setup.run());
        }
        let child = command.spawn().map_err(|e| spawn_error(&process.args, &e))?;
        tracing::debug!(
            id = %self.id,
            pid = child.id(),
            joined = process.init_pid.is_some(),
            "task process spawned"
        );
        Ok(child)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        self.signal_all(signal)
    }

    fn destroy(&self) -> Result<()> {
        let Some(cgroup) = &self.cgroup else {
            return Ok(());
        };
        self.signal_all(Signal::SIGKILL)?;
        let mut attempt = 0;
        loop {
            match cgroup.destroy() {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= CGROUP_REMOVE_ATTEMPTS => return Err(e),
                Err(_) => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::baseline::{BaselineOptions, assemble};
    use burrow_common::meta::Metainfo;

    #[test]
    fn create_rejects_unknown_capability() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = assemble(
            &Metainfo::default(),
            dir.path(),
            &BaselineOptions::current(true),
        );
        config.capabilities = vec!["CAP_FLY".into()];
        let runtime = NamespaceRuntime::new(dir.path());
        let err = runtime.create("n,1", &config).err().unwrap();
        assert!(matches!(err, BurrowError::InvalidArgument { .. }));
    }

    #[test]
    fn create_rejects_missing_rootfs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = assemble(
            &Metainfo::default(),
            &dir.path().join("absent"),
            &BaselineOptions::current(true),
        );
        let runtime = NamespaceRuntime::new(dir.path());
        assert!(runtime.create("n,2", &config).is_err());
    }

    #[test]
    fn cgroup_gets_limits_under_root() {
        let rootfs = tempfile::tempdir().expect("tempdir");
        let cgroups = tempfile::tempdir().expect("tempdir");
        let mut config = assemble(
            &Metainfo::default(),
            rootfs.path(),
            &BaselineOptions::current(false),
        );
        config.resources = ResourceLimits {
            pids_max: Some(16),
            ..ResourceLimits::default()
        };
        let runtime = NamespaceRuntime::new(cgroups.path());
        let _container = runtime.create("n,3", &config).expect("create");
        let pids = std::fs::read_to_string(cgroups.path().join("burrow/n,3/pids.max")).unwrap();
        assert_eq!(pids, "16");
    }
}
