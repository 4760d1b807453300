//! Linux capability management for least-privilege execution.
//!
//! Tasks keep only an allowlist of capabilities. Names use the kernel
//! spelling (`CAP_NET_BIND_SERVICE`); an empty allowlist means
//! [`DEFAULT_CAPABILITIES`].

use burrow_common::error::{BurrowError, Result};

/// Capabilities retained when neither the task nor the template names any.
pub const DEFAULT_CAPABILITIES: [&str; 14] = [
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

/// Picks the effective allowlist: the task's own, else the template's,
/// else the defaults.
#[must_use]
pub fn effective_allowlist(task: &[String], template: &[String]) -> Vec<String> {
    if !task.is_empty() {
        return task.to_vec();
    }
    if !template.is_empty() {
        return template.to_vec();
    }
    DEFAULT_CAPABILITIES.iter().map(|c| (*c).to_string()).collect()
}

/// Checks that every name is a known capability.
///
/// # Errors
///
/// Returns [`BurrowError::InvalidArgument`] naming the first unknown entry.
#[cfg(target_os = "linux")]
pub fn validate(names: &[String]) -> Result<()> {
    for name in names {
        let _: caps::Capability = name
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| BurrowError::InvalidArgument {
                message: format!("unknown capability: {name}"),
            })?;
    }
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; capabilities require Linux.
#[cfg(not(target_os = "linux"))]
pub fn validate(_names: &[String]) -> Result<()> {
    Err(BurrowError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Drops every capability outside `keep` from the bounding, effective,
/// permitted, inheritable, and ambient sets. Runs in the child.
///
/// Names must have passed [`validate`].
///
/// # Errors
///
/// Returns `EPERM` if the kernel refuses a change.
#[cfg(target_os = "linux")]
pub fn restrict_to(keep: &[String]) -> std::io::Result<()> {
    use caps::{CapSet, Capability, CapsHashSet};

    let denied = |_| std::io::Error::from_raw_os_error(libc::EPERM);
    let keep: CapsHashSet = keep
        .iter()
        .filter_map(|name| name.to_ascii_uppercase().parse::<Capability>().ok())
        .collect();

    for cap in caps::read(None, CapSet::Bounding).map_err(denied)? {
        if !keep.contains(&cap) {
            caps::drop(None, CapSet::Bounding, cap).map_err(denied)?;
        }
    }
    let _ = caps::clear(None, CapSet::Ambient);
    for set in [CapSet::Effective, CapSet::Permitted, CapSet::Inheritable] {
        let current = caps::read(None, set).map_err(denied)?;
        let retained: CapsHashSet = current.intersection(&keep).copied().collect();
        caps::set(None, set, &retained).map_err(denied)?;
    }
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; capabilities require Linux.
#[cfg(not(target_os = "linux"))]
pub fn restrict_to(_keep: &[String]) -> std::io::Result<()> {
    Err(crate::unsupported())
}
