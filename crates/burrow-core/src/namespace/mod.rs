//! Linux namespace management for container isolation.
//!
//! The first task of a container creates fresh namespaces with
//! [`unshare_namespaces`]; every later task enters them through a
//! [`NamespaceFiles`] handle opened on the first task. Because a new pid
//! namespace only applies to children of the caller, both paths finish
//! with [`fork_into_pid_namespace`].

pub mod user;
pub mod uts;

use std::fs::File;
use std::path::PathBuf;

use burrow_common::error::{BurrowError, Result};
use burrow_common::meta::Namespace;

pub use user::IdMap;

/// Translates namespace kinds into `clone(2)` flags.
#[cfg(target_os = "linux")]
pub fn clone_flags(namespaces: &[Namespace]) -> nix::sched::CloneFlags {
    use nix::sched::CloneFlags;

    namespaces
        .iter()
        .fold(CloneFlags::empty(), |flags, ns| flags | clone_flag(*ns))
}

#[cfg(target_os = "linux")]
const fn clone_flag(ns: Namespace) -> nix::sched::CloneFlags {
    use nix::sched::CloneFlags;

    match ns {
        Namespace::Uts => CloneFlags::CLONE_NEWUTS,
        Namespace::Ipc => CloneFlags::CLONE_NEWIPC,
        Namespace::Pid => CloneFlags::CLONE_NEWPID,
        Namespace::Net => CloneFlags::CLONE_NEWNET,
        Namespace::Mount => CloneFlags::CLONE_NEWNS,
        Namespace::User => CloneFlags::CLONE_NEWUSER,
        Namespace::Cgroup => CloneFlags::CLONE_NEWCGROUP,
    }
}

/// Creates the given namespaces for the calling process. Runs in the child.
///
/// The user namespace, when requested, is created first and its id maps
/// written before the others so they are owned by it.
///
/// # Errors
///
/// Returns the `unshare(2)` or map-writing error.
#[cfg(target_os = "linux")]
pub fn unshare_namespaces(
    namespaces: &[Namespace],
    uid_map: &IdMap,
    gid_map: &IdMap,
) -> std::io::Result<()> {
    use nix::sched::unshare;

    if namespaces.contains(&Namespace::User) {
        unshare(clone_flag(Namespace::User))?;
        user::write_self_maps(uid_map, gid_map)?;
    }
    let rest: Vec<Namespace> = namespaces
        .iter()
        .copied()
        .filter(|ns| *ns != Namespace::User)
        .collect();
    unshare(clone_flags(&rest))?;
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn unshare_namespaces(
    _namespaces: &[Namespace],
    _uid_map: &IdMap,
    _gid_map: &IdMap,
) -> std::io::Result<()> {
    Err(crate::unsupported())
}

/// Open handles on the namespaces of a running process.
///
/// Opened in the parent so the child only has to call `setns(2)`.
#[derive(Debug)]
pub struct NamespaceFiles {
    files: Vec<(Namespace, File)>,
}

impl NamespaceFiles {
    /// Opens `/proc/<pid>/ns/*` for each requested namespace.
    ///
    /// For the pid namespace the handle names the namespace the process's
    /// children live in, which is where tasks of the container run.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::NotFound`] if the process is gone, or an I/O
    /// error if a namespace file cannot be opened.
    pub fn open(pid: i32, namespaces: &[Namespace]) -> Result<Self> {
        let base = PathBuf::from(format!("/proc/{pid}/ns"));
        if !base.exists() {
            return Err(BurrowError::NotFound {
                kind: "process",
                id: pid.to_string(),
            });
        }
        let mut files = Vec::with_capacity(namespaces.len());
        // The user namespace grants the privileges needed to enter the rest.
        let mut ordered = namespaces.to_vec();
        ordered.sort_by_key(|ns| match ns {
            Namespace::User => 0,
            Namespace::Mount => 2,
            _ => 1,
        });
        for ns in ordered {
            let name = match ns {
                Namespace::Pid => "pid_for_children",
                other => other.proc_name(),
            };
            let path = base.join(name);
            let file = File::open(&path).map_err(|e| BurrowError::io(&path, e))?;
            files.push((ns, file));
        }
        tracing::debug!(pid, count = files.len(), "opened namespace handles");
        Ok(Self { files })
    }

    /// Enters every namespace held by this handle. Runs in the child.
    ///
    /// # Errors
    ///
    /// Returns the first `setns(2)` error.
    #[cfg(target_os = "linux")]
    pub fn join(&self) -> std::io::Result<()> {
        use nix::sched::setns;

        for (ns, file) in &self.files {
            setns(file, clone_flag(*ns))?;
        }
        Ok(())
    }

    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error; namespaces require Linux.
    #[cfg(not(target_os = "linux"))]
    pub fn join(&self) -> std::io::Result<()> {
        Err(crate::unsupported())
    }

    /// Number of namespaces held.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` if no namespace handle is held.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Forks so the caller's next step runs inside a pid namespace created or
/// entered earlier. Runs in the child.
///
/// The calling process stays behind as a relay: it drops every inherited
/// descriptor, ignores termination requests, waits for the forked process,
/// and exits with its status. It returns only in the forked process.
///
/// # Errors
///
/// Returns the `fork(2)` error.
#[cfg(target_os = "linux")]
pub fn fork_into_pid_namespace() -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{SigHandler, Signal, signal};
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};

    // SAFETY: the caller is single-threaded (between fork and exec), so the
    // forked process cannot observe locks held by other threads.
    match unsafe { fork() }? {
        ForkResult::Child => Ok(()),
        ForkResult::Parent { child } => {
            // SAFETY: close_range only closes descriptors of this process,
            // which never touches them again.
            let _ = unsafe { libc::syscall(libc::SYS_close_range, 0, libc::c_uint::MAX, 0) };
            for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP, Signal::SIGQUIT] {
                // SAFETY: SIG_IGN installs no handler code.
                let _ = unsafe { signal(sig, SigHandler::SigIgn) };
            }
            let code = loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, code)) => break code,
                    Ok(WaitStatus::Signaled(_, sig, _)) => break 128 + sig as i32,
                    Ok(_) | Err(Errno::EINTR) => {}
                    Err(_) => break 1,
                }
            };
            // SAFETY: _exit skips atexit handlers inherited from the parent.
            unsafe { libc::_exit(code) }
        }
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; pid namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn fork_into_pid_namespace() -> std::io::Result<()> {
    Err(crate::unsupported())
}
