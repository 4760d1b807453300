//! Mount utilities for container filesystem setup.
//!
//! Everything here except [`parse_options`] runs in the child, inside the
//! container's fresh mount namespace and before it changes root.

use std::path::Path;

use burrow_common::meta::{MaskKind, Mount};

use super::resolve_in_root;

/// Mount flags and filesystem data decoded from `mount(8)`-style options.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Flags passed to the initial `mount(2)`.
    pub flags: nix::mount::MsFlags,
    /// Propagation change applied after mounting, if any.
    pub propagation: Option<nix::mount::MsFlags>,
    /// Comma-joined options the kernel interprets per filesystem.
    pub data: String,
}

/// Decodes `mount(8)`-style options.
///
/// Unknown options are passed to the filesystem as data.
#[cfg(target_os = "linux")]
#[must_use]
pub fn parse_options(options: &[String]) -> MountOptions {
    use nix::mount::MsFlags;

    let mut flags = MsFlags::empty();
    let mut propagation = None;
    let mut data = Vec::new();
    for option in options {
        match option.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => flags.remove(MsFlags::MS_RDONLY),
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "suid" => flags.remove(MsFlags::MS_NOSUID),
            "nodev" => flags |= MsFlags::MS_NODEV,
            "dev" => flags.remove(MsFlags::MS_NODEV),
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "exec" => flags.remove(MsFlags::MS_NOEXEC),
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "private" => propagation = Some(MsFlags::MS_PRIVATE),
            "rprivate" => propagation = Some(MsFlags::MS_PRIVATE | MsFlags::MS_REC),
            "slave" => propagation = Some(MsFlags::MS_SLAVE),
            "rslave" => propagation = Some(MsFlags::MS_SLAVE | MsFlags::MS_REC),
            "shared" => propagation = Some(MsFlags::MS_SHARED),
            "rshared" => propagation = Some(MsFlags::MS_SHARED | MsFlags::MS_REC),
            other => data.push(other),
        }
    }
    MountOptions {
        flags,
        propagation,
        data: data.join(","),
    }
}

/// Makes every mount in the namespace private so nothing leaks back to
/// the host. Runs in the child.
///
/// # Errors
///
/// Returns the `mount(2)` error.
#[cfg(target_os = "linux")]
pub fn make_rprivate() -> std::io::Result<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;
    Ok(())
}

/// Mounts one entry under `rootfs`, creating the mount point as needed.
/// Runs in the child.
///
/// Read-only bind mounts take a second remount, as the kernel ignores
/// `MS_RDONLY` on the initial bind.
///
/// # Errors
///
/// Returns the failing `mount(2)` or mount point creation error.
#[cfg(target_os = "linux")]
pub fn mount_into(rootfs: &Path, entry: &Mount) -> std::io::Result<()> {
    use nix::mount::{MsFlags, mount};

    let target = resolve_in_root(rootfs, &entry.destination);
    let opts = parse_options(&entry.options);
    let bind = opts.flags.contains(MsFlags::MS_BIND);
    if bind && !Path::new(&entry.source).is_dir() {
        create_file_mount_point(&target)?;
    } else {
        std::fs::create_dir_all(&target)?;
    }

    let fstype = (!bind).then_some(entry.fstype.as_str());
    let data = (!opts.data.is_empty()).then_some(opts.data.as_str());
    let initial = if bind {
        opts.flags - MsFlags::MS_RDONLY
    } else {
        opts.flags
    };
    mount(Some(entry.source.as_str()), &target, fstype, initial, data)?;
    if bind && opts.flags.contains(MsFlags::MS_RDONLY) {
        remount_readonly(&target)?;
    }
    if let Some(propagation) = opts.propagation {
        mount(None::<&str>, &target, None::<&str>, propagation, None::<&str>)?;
    }
    Ok(())
}

/// Restricts a path inside `rootfs`. Runs in the child.
///
/// Hidden directories are covered with an empty read-only tmpfs and hidden
/// files with `/dev/null`; read-only paths are bound onto themselves and
/// remounted read-only. Paths that do not exist are skipped.
///
/// # Errors
///
/// Returns the failing `mount(2)` error.
#[cfg(target_os = "linux")]
pub fn mask_path(rootfs: &Path, path: &str, kind: MaskKind) -> std::io::Result<()> {
    use nix::mount::{MsFlags, mount};

    let target = resolve_in_root(rootfs, path);
    let Ok(metadata) = std::fs::symlink_metadata(&target) else {
        return Ok(());
    };
    match kind {
        MaskKind::Hidden if metadata.is_dir() => mount(
            Some("tmpfs"),
            &target,
            Some("tmpfs"),
            MsFlags::MS_RDONLY,
            None::<&str>,
        )?,
        MaskKind::Hidden => mount(
            Some("/dev/null"),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )?,
        MaskKind::Read => {
            bind_self(&target)?;
            remount_readonly(&target)?;
        }
    }
    Ok(())
}

/// Bind-mounts a path onto itself, making it a mount point. Runs in the child.
///
/// # Errors
///
/// Returns the `mount(2)` error.
#[cfg(target_os = "linux")]
pub fn bind_self(path: &Path) -> std::io::Result<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        Some(path),
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    Ok(())
}

/// Remounts a bind mount read-only, keeping the flags the kernel locks
/// inside a user namespace. Runs in the child.
///
/// # Errors
///
/// Returns the `statvfs(2)` or `mount(2)` error.
#[cfg(target_os = "linux")]
pub fn remount_readonly(path: &Path) -> std::io::Result<()> {
    use nix::mount::{MsFlags, mount};
    use nix::sys::statvfs::{FsFlags, statvfs};

    let current = statvfs(path)?.flags();
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
    for (fs, ms) in [
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
    ] {
        if current.contains(fs) {
            flags |= ms;
        }
    }
    mount(None::<&str>, path, None::<&str>, flags, None::<&str>)?;
    Ok(())
}

/// Changes root into `rootfs` and the working directory to `cwd`.
/// Runs in the child.
///
/// # Errors
///
/// Returns the `chroot(2)` or `chdir(2)` error.
#[cfg(target_os = "linux")]
pub fn enter_root(rootfs: &Path, cwd: &str) -> std::io::Result<()> {
    nix::unistd::chroot(rootfs)?;
    nix::unistd::chdir(if cwd.is_empty() { "/" } else { cwd })?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn create_file_mount_point(target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !target.exists() {
        let _ = std::fs::File::create(target)?;
    }
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn make_rprivate() -> std::io::Result<()> {
    Err(crate::unsupported())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_into(_rootfs: &Path, _entry: &Mount) -> std::io::Result<()> {
    Err(crate::unsupported())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn mask_path(_rootfs: &Path, _path: &str, _kind: MaskKind) -> std::io::Result<()> {
    Err(crate::unsupported())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn bind_self(_path: &Path) -> std::io::Result<()> {
    Err(crate::unsupported())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn remount_readonly(_path: &Path) -> std::io::Result<()> {
    Err(crate::unsupported())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn enter_root(_rootfs: &Path, _cwd: &str) -> std::io::Result<()> {
    Err(crate::unsupported())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use nix::mount::MsFlags;

    fn opts(list: &[&str]) -> MountOptions {
        parse_options(&list.iter().map(|s| (*s).to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn proc_options() {
        let parsed = opts(&["noexec", "nosuid", "nodev"]);
        assert_eq!(
            parsed.flags,
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV
        );
        assert!(parsed.data.is_empty());
        assert!(parsed.propagation.is_none());
    }

    #[test]
    fn unknown_options_become_data() {
        let parsed = opts(&["nosuid", "strictatime", "mode=755", "size=65536k"]);
        assert!(parsed.flags.contains(MsFlags::MS_STRICTATIME));
        assert_eq!(parsed.data, "mode=755,size=65536k");
    }

    #[test]
    fn rbind_ro_private() {
        let parsed = opts(&["rbind", "ro", "rprivate"]);
        assert!(parsed.flags.contains(MsFlags::MS_BIND | MsFlags::MS_REC));
        assert!(parsed.flags.contains(MsFlags::MS_RDONLY));
        assert_eq!(parsed.propagation, Some(MsFlags::MS_PRIVATE | MsFlags::MS_REC));
    }

    #[test]
    fn later_options_override_earlier() {
        let parsed = opts(&["ro", "rw"]);
        assert!(!parsed.flags.contains(MsFlags::MS_RDONLY));
    }
}
