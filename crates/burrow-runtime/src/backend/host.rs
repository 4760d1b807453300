//! Unisolated backend running tasks as ordinary host processes.
//!
//! The rootfs only supplies the working directory. Nothing is created
//! per container, so signalling the container as a whole is left to the
//! per-task process groups.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use burrow_common::error::{BurrowError, Result};
use burrow_core::filesystem::resolve_in_root;
use nix::sys::signal::Signal;

use super::{ProcessSpec, Runtime, RuntimeContainer, TaskStdio, spawn_error};
use crate::baseline::RuntimeConfig;

/// [`Runtime`] for processes without isolation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRuntime;

impl HostRuntime {
    /// Creates the host runtime.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Runtime for HostRuntime {
    fn create(&self, id: &str, config: &RuntimeConfig) -> Result<Box<dyn RuntimeContainer>> {
        tracing::debug!(id, rootfs = %config.rootfs.display(), "host container prepared");
        Ok(Box::new(HostContainer {
            rootfs: config.rootfs.clone(),
        }))
    }
}

#[derive(Debug)]
struct HostContainer {
    rootfs: PathBuf,
}

impl RuntimeContainer for HostContainer {
    fn run(&self, process: &ProcessSpec, stdio: TaskStdio) -> Result<Child> {
        let (program, args) = process
            .args
            .split_first()
            .ok_or_else(|| BurrowError::InvalidArgument {
                message: "empty command".into(),
            })?;
        let stdout = stdio
            .output
            .try_clone()
            .map_err(|e| spawn_error(&process.args, &e))?;
        let mut command = Command::new(program);
        let _ = command
            .args(args)
            .env_clear()
            .envs(process.env.iter().map(|(k, v)| (k, v)))
            .current_dir(resolve_in_root(&self.rootfs, &process.cwd))
            .stdin(Stdio::from(stdio.stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stdio.output))
            .process_group(0);
        command.spawn().map_err(|e| spawn_error(&process.args, &e))
    }

    fn signal(&self, _signal: Signal) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        Ok(())
    }
}
