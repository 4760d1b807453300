//! Container backend abstraction.
//!
//! A [`Runtime`] materializes a [`RuntimeConfig`] into a
//! [`RuntimeContainer`], which spawns task processes inside it. The
//! namespace backend isolates tasks with Linux namespaces and cgroups; the
//! host backend runs them as plain processes and exists for development
//! and tests.

pub mod host;
pub mod namespace;

use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::Child;

use burrow_common::config::RuntimeKind;
use burrow_common::error::{BurrowError, Result};
use burrow_common::meta::Rlimit;
use nix::sys::signal::Signal;

pub use host::HostRuntime;
pub use namespace::NamespaceRuntime;

use crate::baseline::RuntimeConfig;

/// What to execute for one task, after validation and defaulting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Program and arguments.
    pub args: Vec<String>,
    /// Complete environment.
    pub env: Vec<(String, String)>,
    /// Working directory inside the container.
    pub cwd: String,
    /// A live task whose namespaces this one enters; `None` for the task
    /// that creates them.
    pub init_pid: Option<i32>,
    /// Capabilities kept.
    pub capabilities: Vec<String>,
    /// Rlimits applied before exec.
    pub rlimits: Vec<Rlimit>,
}

/// Pipe ends handed to a spawned task.
#[derive(Debug)]
pub struct TaskStdio {
    /// Read end of the stdin pipe.
    pub stdin: OwnedFd,
    /// Write end of the pipe carrying both stdout and stderr.
    pub output: OwnedFd,
}

/// Creates containers.
pub trait Runtime: Send + Sync {
    /// Prepares a container; no process runs yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is rejected or the container's
    /// resources cannot be set up.
    fn create(&self, id: &str, config: &RuntimeConfig) -> Result<Box<dyn RuntimeContainer>>;
}

/// A materialized container.
pub trait RuntimeContainer: Send + Sync {
    /// Spawns a task process with the given stdio.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned; failures between
    /// fork and exec are reported here too.
    fn run(&self, process: &ProcessSpec, stdio: TaskStdio) -> Result<Child>;

    /// Sends `signal` to every process of the container, including ones
    /// that are not tracked tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the container's processes cannot be enumerated.
    fn signal(&self, signal: Signal) -> Result<()>;

    /// Releases the container's resources. Tasks must have exited.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource cannot be released.
    fn destroy(&self) -> Result<()>;
}

/// Creates the runtime for the configured backend.
#[must_use]
pub fn select(kind: RuntimeKind, cgroup_root: &Path) -> Box<dyn Runtime> {
    match kind {
        RuntimeKind::Namespace => Box::new(NamespaceRuntime::new(cgroup_root)),
        RuntimeKind::Host => Box::new(HostRuntime::new()),
    }
}

/// Turns a spawn failure into a runtime error naming the program.
pub(crate) fn spawn_error(args: &[String], err: &std::io::Error) -> BurrowError {
    BurrowError::Runtime {
        message: format!(
            "cannot start {}: {err}",
            args.first().map_or("<empty>", String::as_str)
        ),
    }
}
