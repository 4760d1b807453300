//! # burrow-core
//!
//! Low-level Linux isolation primitives for the Burrow runtime.
//!
//! This crate provides thin, safe wrappers over:
//! - **Namespaces**: creating, entering, and mapping ids in user namespaces.
//! - **Cgroups v2**: per-container CPU, memory, I/O, and pid limits.
//! - **Filesystem**: mounts inside a root filesystem, path masking, `chroot`.
//! - **Capabilities**: restricting a process to an allowlist.
//! - **Rlimits**: per-process resource limits.
//!
//! Functions documented as running *in the child* are called between
//! `fork` and `exec`. They return [`std::io::Result`] so the error code
//! reaches the spawning parent, and they never log.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod rlimit;

/// Error returned by child-side helpers on platforms without namespaces.
#[cfg(not(target_os = "linux"))]
pub(crate) fn unsupported() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "Linux required for native container operations",
    )
}
