//! Declarative container template.
//!
//! A [`Metainfo`] describes how a container should be isolated: which
//! namespaces it gets, what it may mount, how many resources it may use.
//! It is produced by an external template store and never mutated here
//! beyond merging the secure defaults.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BurrowError;

/// Namespaces every container gets regardless of its template.
pub const REQUIRED_NAMESPACES: [Namespace; 5] = [
    Namespace::Uts,
    Namespace::Ipc,
    Namespace::Pid,
    Namespace::Mount,
    Namespace::User,
];

/// A Linux namespace type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Hostname and domain name.
    Uts,
    /// System V IPC and POSIX message queues.
    Ipc,
    /// Process ids.
    Pid,
    /// Network devices, addresses, and ports.
    Net,
    /// Mount table.
    Mount,
    /// User and group ids.
    User,
    /// Cgroup root directory.
    Cgroup,
}

impl Namespace {
    /// Name of this namespace's entry under `/proc/<pid>/ns`.
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Pid => "pid",
            Self::Net => "net",
            Self::Mount => "mnt",
            Self::User => "user",
            Self::Cgroup => "cgroup",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

impl FromStr for Namespace {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uts" => Ok(Self::Uts),
            "ipc" => Ok(Self::Ipc),
            "pid" => Ok(Self::Pid),
            "net" | "network" => Ok(Self::Net),
            "mnt" | "mount" => Ok(Self::Mount),
            "user" => Ok(Self::User),
            "cgroup" => Ok(Self::Cgroup),
            other => Err(BurrowError::InvalidArgument {
                message: format!("unknown namespace: {other}"),
            }),
        }
    }
}

/// A filesystem to mount inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Source device, directory, or pseudo-filesystem name.
    pub source: String,
    /// Absolute path inside the container.
    pub destination: String,
    /// Filesystem type; `none` for bind mounts.
    #[serde(default = "default_fstype")]
    pub fstype: String,
    /// `mount(8)`-style options such as `ro`, `nosuid`, `rbind`, `mode=755`.
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_fstype() -> String {
    "none".into()
}

impl Mount {
    /// Creates a mount of a pseudo-filesystem.
    #[must_use]
    pub fn new(source: &str, destination: &str, fstype: &str, options: &[&str]) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            fstype: fstype.into(),
            options: options.iter().map(|o| (*o).to_string()).collect(),
        }
    }

    /// Creates a bind mount of a host path.
    #[must_use]
    pub fn bind(source: &str, destination: &str, options: &[&str]) -> Self {
        let mut mount = Self::new(source, destination, "none", options);
        if !mount.is_bind() {
            mount.options.insert(0, "rbind".into());
        }
        mount
    }

    /// Returns `true` if this mount is a bind mount.
    pub fn is_bind(&self) -> bool {
        self.options.iter().any(|o| o == "bind" || o == "rbind")
    }
}

/// How a masked path is hidden from the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskKind {
    /// The path stays visible but is remounted read-only.
    Read,
    /// The path is covered so its contents are unreadable.
    Hidden,
}

/// A path restricted inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMask {
    /// Absolute path inside the container.
    pub path: String,
    /// Restriction applied.
    pub mask: MaskKind,
}

/// A process resource limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    /// Limit name, e.g. `RLIMIT_NOFILE`.
    pub kind: String,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

/// Resource limits applied through cgroups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Relative CPU weight (1 to 10000).
    pub cpu_shares: Option<u64>,
    /// Hard memory limit in bytes.
    pub memory_bytes: Option<u64>,
    /// Relative I/O weight (1 to 10000).
    pub io_weight: Option<u16>,
    /// Maximum number of processes.
    pub pids_max: Option<u64>,
}

/// Declarative container template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metainfo {
    /// Template name.
    pub name: String,
    /// Hostname inside the container; defaults to the name.
    pub hostname: String,
    /// Namespaces to isolate.
    pub namespaces: Vec<Namespace>,
    /// Capabilities retained by tasks, as `CAP_*` names.
    pub capabilities: Vec<String>,
    /// Cgroup resource limits.
    pub resources: ResourceLimits,
    /// Additional mounts.
    pub mounts: Vec<Mount>,
    /// Extra masked or read-only paths.
    pub mask_paths: Vec<PathMask>,
    /// Default resource limits for every task.
    pub rlimits: Vec<Rlimit>,
    /// Number of ids mapped in the user namespace, starting at the caller's uid.
    pub uid_map_size: u32,
    /// Number of ids mapped in the user namespace, starting at the caller's gid.
    pub gid_map_size: u32,
    /// Whether the root filesystem is mounted read-only.
    pub readonly_rootfs: bool,
}

impl Metainfo {
    /// Returns a copy merged with the secure defaults.
    ///
    /// Required namespaces are added, unset id-map sizes become one, and an
    /// empty hostname takes the template name. Caller values are kept.
    #[must_use]
    pub fn with_defaults(&self) -> Self {
        let mut merged = self.clone();
        for ns in REQUIRED_NAMESPACES {
            if !merged.namespaces.contains(&ns) {
                merged.namespaces.push(ns);
            }
        }
        merged.namespaces.sort();
        merged.namespaces.dedup();
        if merged.uid_map_size == 0 {
            merged.uid_map_size = 1;
        }
        if merged.gid_map_size == 0 {
            merged.gid_map_size = 1;
        }
        if merged.hostname.is_empty() {
            merged.hostname.clone_from(&merged.name);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_add_required_namespaces() {
        let meta = Metainfo {
            name: "web".into(),
            namespaces: vec![Namespace::Net],
            ..Metainfo::default()
        };
        let merged = meta.with_defaults();
        for ns in REQUIRED_NAMESPACES {
            assert!(merged.namespaces.contains(&ns), "missing {ns}");
        }
        assert!(merged.namespaces.contains(&Namespace::Net));
        assert_eq!(merged.hostname, "web");
        assert_eq!(merged.uid_map_size, 1);
    }

    #[test]
    fn defaults_keep_caller_values() {
        let meta = Metainfo {
            name: "db".into(),
            hostname: "primary".into(),
            uid_map_size: 65536,
            ..Metainfo::default()
        };
        let merged = meta.with_defaults();
        assert_eq!(merged.hostname, "primary");
        assert_eq!(merged.uid_map_size, 65536);
        assert_eq!(merged.with_defaults(), merged);
    }

    #[test]
    fn namespace_parses_aliases() {
        assert_eq!("mnt".parse::<Namespace>().unwrap(), Namespace::Mount);
        assert_eq!("NETWORK".parse::<Namespace>().unwrap(), Namespace::Net);
        assert!("time".parse::<Namespace>().is_err());
    }

    #[test]
    fn bind_helper_marks_rbind() {
        let mount = Mount::bind("/etc/resolv.conf", "/etc/resolv.conf", &["ro"]);
        assert!(mount.is_bind());
        assert_eq!(mount.options, vec!["rbind", "ro"]);
    }

    #[test]
    fn metainfo_accepts_sparse_json() {
        let meta: Metainfo = serde_json::from_str(r#"{"name":"x","namespaces":["net"]}"#).unwrap();
        assert_eq!(meta.namespaces, vec![Namespace::Net]);
        assert!(meta.mounts.is_empty());
    }
}
