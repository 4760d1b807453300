//! Secure baseline merged into every container.
//!
//! [`assemble`] turns a template into the [`RuntimeConfig`] a backend
//! materializes: required namespaces, pseudo-filesystems, masked and
//! read-only system paths, and a user namespace mapped onto the invoking
//! user. Caller mounts are added on top, except over `/proc`, `/sys`, and
//! `/dev`, which the baseline owns.

use std::path::{Path, PathBuf};

use burrow_common::meta::{MaskKind, Metainfo, Mount, Namespace, ResourceLimits, Rlimit};
use burrow_core::namespace::IdMap;
use serde::{Deserialize, Serialize};

/// Paths hidden from every container.
pub const DEFAULT_MASKED_PATHS: [&str; 10] = [
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

/// Paths every container sees read-only.
pub const DEFAULT_READONLY_PATHS: [&str; 5] = [
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Host device nodes bound into the container's `/dev`.
const DEFAULT_DEVICES: [&str; 6] = [
    "/dev/null",
    "/dev/zero",
    "/dev/full",
    "/dev/random",
    "/dev/urandom",
    "/dev/tty",
];

const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Fully assembled container configuration, persisted with the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root filesystem on the host.
    pub rootfs: PathBuf,
    /// Hostname inside the container.
    pub hostname: String,
    /// Namespaces the first task creates.
    pub namespaces: Vec<Namespace>,
    /// Mounts applied in order under the rootfs.
    pub mounts: Vec<Mount>,
    /// Paths covered so their contents are unreadable.
    pub masked_paths: Vec<String>,
    /// Paths remounted read-only.
    pub readonly_paths: Vec<String>,
    /// User namespace uid mapping.
    pub uid_map: IdMap,
    /// User namespace gid mapping.
    pub gid_map: IdMap,
    /// Capabilities tasks keep unless they name their own.
    pub capabilities: Vec<String>,
    /// Rlimits every task starts with.
    pub rlimits: Vec<Rlimit>,
    /// Cgroup limits.
    pub resources: ResourceLimits,
    /// Whether the rootfs itself is read-only.
    pub readonly_rootfs: bool,
    /// Whether the node runs without root.
    pub rootless: bool,
}

/// Host facts the baseline depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaselineOptions {
    /// Whether the node runs without root.
    pub rootless: bool,
    /// Host uid container root maps to.
    pub host_uid: u32,
    /// Host gid container root maps to.
    pub host_gid: u32,
}

impl BaselineOptions {
    /// Options for the current process.
    pub fn current(rootless: bool) -> Self {
        Self {
            rootless,
            host_uid: nix::unistd::geteuid().as_raw(),
            host_gid: nix::unistd::getegid().as_raw(),
        }
    }
}

/// Merges the secure baseline with a template.
#[must_use]
pub fn assemble(meta: &Metainfo, rootfs: &Path, opts: &BaselineOptions) -> RuntimeConfig {
    let meta = meta.with_defaults();

    let mut namespaces = meta.namespaces.clone();
    if !opts.rootless && !namespaces.contains(&Namespace::Net) {
        namespaces.push(Namespace::Net);
    }
    namespaces.sort();

    let mut mounts = default_mounts(opts.rootless);
    mounts.extend(
        meta.mounts
            .iter()
            .filter(|m| !is_reserved(&m.destination))
            .cloned(),
    );
    if Path::new(HOST_RESOLV_CONF).exists() {
        mounts.push(Mount::bind(HOST_RESOLV_CONF, HOST_RESOLV_CONF, &["ro"]));
    }

    let mut masked_paths: Vec<String> = DEFAULT_MASKED_PATHS.iter().map(|p| (*p).to_string()).collect();
    let mut readonly_paths: Vec<String> = DEFAULT_READONLY_PATHS.iter().map(|p| (*p).to_string()).collect();
    let mut readonly_rootfs = meta.readonly_rootfs;
    for mask in &meta.mask_paths {
        if mask.mask == MaskKind::Read && mask.path.trim_end_matches('/').is_empty() {
            readonly_rootfs = true;
            continue;
        }
        let list = match mask.mask {
            MaskKind::Hidden => &mut masked_paths,
            MaskKind::Read => &mut readonly_paths,
        };
        if !list.contains(&mask.path) {
            list.push(mask.path.clone());
        }
    }

    RuntimeConfig {
        rootfs: rootfs.to_path_buf(),
        hostname: meta.hostname.clone(),
        namespaces,
        mounts,
        masked_paths,
        readonly_paths,
        uid_map: IdMap::root_to(opts.host_uid, meta.uid_map_size),
        gid_map: IdMap::root_to(opts.host_gid, meta.gid_map_size),
        capabilities: meta.capabilities.clone(),
        rlimits: meta.rlimits.clone(),
        resources: meta.resources.clone(),
        readonly_rootfs,
        rootless: opts.rootless,
    }
}

fn default_mounts(rootless: bool) -> Vec<Mount> {
    let mut mounts = vec![
        Mount::new("proc", "/proc", "proc", &["noexec", "nosuid", "nodev"]),
        Mount::new(
            "tmpfs",
            "/dev",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
    ];
    mounts.extend(DEFAULT_DEVICES.iter().map(|dev| Mount::new(dev, dev, "none", &["bind"])));
    mounts.push(Mount::new(
        "shm",
        "/dev/shm",
        "tmpfs",
        &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
    ));
    if rootless {
        mounts.push(Mount::bind("/sys", "/sys", &["nosuid", "noexec", "nodev", "ro"]));
    } else {
        mounts.push(Mount::new(
            "sysfs",
            "/sys",
            "sysfs",
            &["nosuid", "noexec", "nodev", "ro"],
        ));
    }
    mounts
}

/// Returns `true` for destinations the baseline owns.
fn is_reserved(destination: &str) -> bool {
    let path = destination.trim_end_matches('/');
    ["/proc", "/sys", "/dev"].iter().any(|root| {
        path == *root
            || path
                .strip_prefix(root)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_common::meta::PathMask;

    fn opts(rootless: bool) -> BaselineOptions {
        BaselineOptions {
            rootless,
            host_uid: 1000,
            host_gid: 1000,
        }
    }

    #[test]
    fn net_namespace_only_when_rooted() {
        let meta = Metainfo::default();
        let rooted = assemble(&meta, Path::new("/r"), &opts(false));
        let rootless = assemble(&meta, Path::new("/r"), &opts(true));
        assert!(rooted.namespaces.contains(&Namespace::Net));
        assert!(!rootless.namespaces.contains(&Namespace::Net));
        assert!(rootless.namespaces.contains(&Namespace::User));
    }

    #[test]
    fn sys_is_bound_read_only_when_rootless() {
        let config = assemble(&Metainfo::default(), Path::new("/r"), &opts(true));
        let sys = config.mounts.iter().find(|m| m.destination == "/sys").unwrap();
        assert!(sys.is_bind());
        assert!(sys.options.iter().any(|o| o == "ro"));

        let config = assemble(&Metainfo::default(), Path::new("/r"), &opts(false));
        let sys = config.mounts.iter().find(|m| m.destination == "/sys").unwrap();
        assert_eq!(sys.fstype, "sysfs");
    }

    #[test]
    fn caller_mounts_over_system_paths_are_dropped() {
        let meta = Metainfo {
            mounts: vec![
                Mount::bind("/host/proc", "/proc", &[]),
                Mount::bind("/host/dev", "/dev/shm", &[]),
                Mount::bind("/data", "/data", &[]),
                Mount::bind("/d", "/devices", &[]),
            ],
            ..Metainfo::default()
        };
        let config = assemble(&meta, Path::new("/r"), &opts(true));
        assert!(!config.mounts.iter().any(|m| m.source == "/host/proc"));
        assert!(!config.mounts.iter().any(|m| m.source == "/host/dev"));
        assert!(config.mounts.iter().any(|m| m.destination == "/data"));
        assert!(config.mounts.iter().any(|m| m.destination == "/devices"));
    }

    #[test]
    fn masks_and_id_maps() {
        let meta = Metainfo {
            mask_paths: vec![
                PathMask {
                    path: "/proc/kcore".into(),
                    mask: MaskKind::Hidden,
                },
                PathMask {
                    path: "/etc/secret".into(),
                    mask: MaskKind::Read,
                },
            ],
            uid_map_size: 65536,
            ..Metainfo::default()
        };
        let config = assemble(&meta, Path::new("/r"), &opts(true));
        assert_eq!(
            config.masked_paths.iter().filter(|p| *p == "/proc/kcore").count(),
            1
        );
        assert!(config.readonly_paths.contains(&"/etc/secret".to_string()));
        assert!(config.readonly_paths.contains(&"/proc/sys".to_string()));
        assert_eq!(config.uid_map, IdMap::root_to(1000, 65536));
        assert_eq!(config.gid_map, IdMap::root_to(1000, 1));
    }

    #[test]
    fn read_mask_on_root_makes_rootfs_read_only() {
        let meta = Metainfo {
            mask_paths: vec![PathMask {
                path: "/".into(),
                mask: MaskKind::Read,
            }],
            ..Metainfo::default()
        };
        let config = assemble(&meta, Path::new("/r"), &opts(true));
        assert!(config.readonly_rootfs);
        assert!(!config.readonly_paths.contains(&"/".to_string()));
    }

    #[test]
    fn proc_is_mounted_before_dev_devices() {
        let config = assemble(&Metainfo::default(), Path::new("/r"), &opts(false));
        let dests: Vec<&str> = config.mounts.iter().map(|m| m.destination.as_str()).collect();
        let dev = dests.iter().position(|d| *d == "/dev").unwrap();
        let null = dests.iter().position(|d| *d == "/dev/null").unwrap();
        assert_eq!(dests[0], "/proc");
        assert!(dev < null);
    }
}
