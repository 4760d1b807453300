//! Filesystem setup for container isolation.
//!
//! Mounts are applied to paths under the container's root filesystem
//! before the task changes its root into it.

pub mod mount;

use std::path::{Path, PathBuf};

/// Resolves an absolute container path to its location under `rootfs`.
#[must_use]
pub fn resolve_in_root(rootfs: &Path, path: &str) -> PathBuf {
    rootfs.join(path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_strips_leading_slashes() {
        let root = Path::new("/srv/rootfs");
        assert_eq!(resolve_in_root(root, "/proc"), PathBuf::from("/srv/rootfs/proc"));
        assert_eq!(resolve_in_root(root, "dev/pts"), PathBuf::from("/srv/rootfs/dev/pts"));
        assert_eq!(resolve_in_root(root, "/"), PathBuf::from("/srv/rootfs/"));
    }
}
