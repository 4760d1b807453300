//! Cgroups v2 resource management.
//!
//! Each container gets a directory under `<root>/burrow/<id>` in the
//! unified hierarchy. Tasks join it from the child side by writing `0` to
//! the `cgroup.procs` handle opened here, so no task ever runs outside it.

pub mod cpu;
pub mod io;
pub mod memory;
pub mod pids;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use burrow_common::constants::APP_NAME;
use burrow_common::error::{BurrowError, Result};
use burrow_common::meta::ResourceLimits;

/// Handle to a cgroup for a specific container.
#[derive(Debug)]
pub struct CgroupManager {
    path: PathBuf,
}

impl CgroupManager {
    /// Creates the cgroup for a container under the given hierarchy root.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be created.
    pub fn create(root: &Path, container_id: &str) -> Result<Self> {
        let path = root.join(APP_NAME).join(container_id);
        std::fs::create_dir_all(&path).map_err(|e| BurrowError::io(&path, e))?;
        tracing::info!(path = %path.display(), "cgroup created");
        Ok(Self { path })
    }

    /// Path of this cgroup's directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies resource limits to this cgroup.
    ///
    /// Delegates to subsystem-specific writers for CPU, memory, I/O, and pids.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to a cgroup control file fails.
    pub fn apply_limits(&self, limits: &ResourceLimits) -> Result<()> {
        if let Some(mem) = limits.memory_bytes {
            memory::set_memory_max(&self.path, mem)?;
        }
        if let Some(cpu_weight) = limits.cpu_shares {
            cpu::set_cpu_weight(&self.path, cpu_weight)?;
        }
        if let Some(io_weight) = limits.io_weight {
            io::set_io_weight(&self.path, io_weight)?;
        }
        if let Some(max) = limits.pids_max {
            pids::set_pids_max(&self.path, max)?;
        }
        Ok(())
    }

    /// Opens `cgroup.procs` for writing, for a child to join with.
    ///
    /// # Errors
    ///
    /// Returns an error if the control file cannot be opened.
    pub fn open_procs(&self) -> Result<File> {
        let procs_path = self.path.join("cgroup.procs");
        OpenOptions::new()
            .write(true)
            .open(&procs_path)
            .map_err(|e| BurrowError::io(procs_path, e))
    }

    /// Lists the processes currently in this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` cannot be read.
    pub fn processes(&self) -> Result<Vec<i32>> {
        let procs_path = self.path.join("cgroup.procs");
        let raw =
            std::fs::read_to_string(&procs_path).map_err(|e| BurrowError::io(&procs_path, e))?;
        Ok(parse_pids(&raw))
    }

    /// Removes the cgroup. It must contain no processes.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_dir(&self.path).map_err(|e| BurrowError::io(&self.path, e))?;
        }
        tracing::info!(path = %self.path.display(), "cgroup destroyed");
        Ok(())
    }
}

/// Writes a single value to a cgroup control file.
pub(crate) fn write_control(cgroup_path: &Path, file: &str, value: &str) -> Result<()> {
    let path = cgroup_path.join(file);
    std::fs::write(&path, value).map_err(|e| BurrowError::io(path, e))
}

fn parse_pids(raw: &str) -> Vec<i32> {
    raw.lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pids_skips_blank_lines() {
        assert_eq!(parse_pids("12\n\n345\n"), vec![12, 345]);
    }

    #[test]
    fn limits_are_written_to_control_files() {
        let root = tempfile::tempdir().expect("tempdir");
        let cgroup = CgroupManager::create(root.path(), "node,1").expect("create");
        let limits = ResourceLimits {
            cpu_shares: Some(200),
            memory_bytes: Some(64 * 1024 * 1024),
            io_weight: Some(50),
            pids_max: Some(32),
        };
        cgroup.apply_limits(&limits).expect("apply");
        let read = |name: &str| std::fs::read_to_string(cgroup.path().join(name)).unwrap();
        assert_eq!(read("cpu.weight"), "200");
        assert_eq!(read("memory.max"), "67108864");
        assert_eq!(read("io.weight"), "default 50");
        assert_eq!(read("pids.max"), "32");
    }

    #[test]
    fn processes_reads_procs_file() {
        let root = tempfile::tempdir().expect("tempdir");
        let cgroup = CgroupManager::create(root.path(), "node,2").expect("create");
        std::fs::write(cgroup.path().join("cgroup.procs"), "7\n9\n").unwrap();
        assert_eq!(cgroup.processes().unwrap(), vec![7, 9]);
    }
}
