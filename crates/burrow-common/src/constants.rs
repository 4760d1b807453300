//! System-wide constants and default paths.

use std::path::PathBuf;

/// Default base directory for Burrow data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/burrow";

/// Returns the default data directory, preferring `$HOME/.burrow` and
/// falling back to `/var/lib/burrow` when no home directory is set.
pub fn default_data_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home).join(".burrow"),
        _ => PathBuf::from(SYSTEM_DATA_DIR),
    }
}

/// File name of the embedded store inside the data directory.
pub const STORE_FILE: &str = "store.json";

/// Subdirectory of the data directory that relative rootfs paths resolve under.
pub const ROOTFS_DIR: &str = "rootfs";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Application name used in logs, cgroup paths, and service registration.
pub const APP_NAME: &str = "burrow";

/// Separator between the node id and the per-node sequence in a container id.
pub const ID_SEPARATOR: char = ',';

/// Store key holding the node's persistent identity.
pub const NODE_ID_KEY: &str = "id";

/// Store prefix for persisted container records.
pub const CNTR_PREFIX: &str = "cntr";

/// Size in bytes of an attach token on the wire.
pub const ATTACH_TOKEN_LEN: usize = 16;

/// Default maximum number of results a single remote list call may return.
pub const DEFAULT_QUERY_LIMIT: usize = 64;

/// Default maximum number of concurrent attach sessions per node.
pub const DEFAULT_ATTACH_SESSION_LIMIT: usize = 64;

/// Default lifetime of an attach token, in seconds.
pub const DEFAULT_ATTACH_TOKEN_TTL_SECS: u64 = 60;

/// Default deadline for a remote call, in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Default control-channel listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7420";

/// Default attach listen address.
pub const DEFAULT_ATTACH_ADDR: &str = "127.0.0.1:7421";

/// Default service name used for cluster registration.
pub const DEFAULT_SERVICE_NAME: &str = "burrow";

/// Service metadata key naming the attach endpoint's network.
pub const META_ATTACH_NETWORK: &str = "attachNetwork";

/// Service metadata key holding the attach endpoint's address.
pub const META_ATTACH_ADDR: &str = "attach";

/// Default `PATH` for tasks that do not set one.
pub const DEFAULT_TASK_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
