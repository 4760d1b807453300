//! Domain primitive types used across the Burrow workspace.

use serde::{Deserialize, Serialize};

use crate::constants::ID_SEPARATOR;
use crate::meta::{Metainfo, Rlimit};

/// Builds a container id from the owning node's identity and a
/// node-local sequence number.
#[must_use]
pub fn compose_id(node_id: &str, seq: u64) -> String {
    format!("{node_id}{ID_SEPARATOR}{seq}")
}

/// Splits a container id into its node identity and the remainder.
///
/// Returns `None` if the id carries no node component.
#[must_use]
pub fn split_id(id: &str) -> Option<(&str, &str)> {
    id.split_once(ID_SEPARATOR)
        .filter(|(node, _)| !node.is_empty())
}

/// Input to container creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CntrSpec {
    /// Path to an already-unpacked root filesystem.
    pub rootfs: String,
    /// Free-form labels; the only part of a container mutable after creation.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Template the container is materialized from.
    pub meta: Metainfo,
}

/// One container instance, as persisted and reported by its owning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cntrinfo {
    /// Cluster-unique id, assigned once by the owning node.
    pub id: String,
    /// Resolved root filesystem path on the owning node.
    pub rootfs: String,
    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Template merged with the secure defaults.
    pub meta: Metainfo,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// Process specification for a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taskinfo {
    /// Program and arguments; the first element is the executable.
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory inside the container, `/` if unset.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Capabilities the task keeps; empty means the container default.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Resource limits applied to the task.
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,
    /// Terminal rows exported as `LINES`, zero if unknown.
    #[serde(default)]
    pub term_height: u16,
    /// Terminal columns exported as `COLUMNS`, zero if unknown.
    #[serde(default)]
    pub term_width: u16,
}

impl Taskinfo {
    /// Creates a task description running the given command line.
    #[must_use]
    pub fn command<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}
