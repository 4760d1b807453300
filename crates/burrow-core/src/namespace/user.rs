//! User namespace id mapping.
//!
//! Maps container UIDs/GIDs onto the invoking user so containers run
//! without host privileges.

use serde::{Deserialize, Serialize};

/// One contiguous range of a uid or gid mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    /// First id inside the namespace.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of ids mapped.
    pub size: u32,
}

impl IdMap {
    /// Maps container root onto the given host id.
    #[must_use]
    pub const fn root_to(host_id: u32, size: u32) -> Self {
        Self {
            container_id: 0,
            host_id,
            size,
        }
    }

    /// Renders the mapping in `/proc/<pid>/uid_map` syntax.
    #[must_use]
    pub fn to_proc_line(&self) -> String {
        format!("{} {} {}", self.container_id, self.host_id, self.size)
    }
}

/// Writes the calling process's uid and gid maps. Runs in the child, right
/// after it created its user namespace.
///
/// `setgroups` is denied first, as unprivileged users must before writing
/// a gid map.
///
/// # Errors
///
/// Returns the failing write.
#[cfg(target_os = "linux")]
pub fn write_self_maps(uid_map: &IdMap, gid_map: &IdMap) -> std::io::Result<()> {
    match std::fs::write("/proc/self/setgroups", "deny") {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    std::fs::write("/proc/self/uid_map", uid_map.to_proc_line())?;
    std::fs::write("/proc/self/gid_map", gid_map.to_proc_line())?;
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; id mapping requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn write_self_maps(_uid_map: &IdMap, _gid_map: &IdMap) -> std::io::Result<()> {
    Err(crate::unsupported())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_line_format() {
        assert_eq!(IdMap::root_to(1000, 1).to_proc_line(), "0 1000 1");
    }
}
