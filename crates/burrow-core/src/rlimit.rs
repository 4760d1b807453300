//! Per-process resource limits.

use burrow_common::error::{BurrowError, Result};
use burrow_common::meta::Rlimit;

/// Checks that every limit names a known resource and that soft does not
/// exceed hard.
///
/// # Errors
///
/// Returns [`BurrowError::InvalidArgument`] for the first bad entry.
pub fn validate(limits: &[Rlimit]) -> Result<()> {
    for limit in limits {
        if !KNOWN.contains(&limit.kind.to_ascii_uppercase().as_str()) {
            return Err(BurrowError::InvalidArgument {
                message: format!("unknown rlimit: {}", limit.kind),
            });
        }
        if limit.soft > limit.hard {
            return Err(BurrowError::InvalidArgument {
                message: format!("{}: soft limit exceeds hard limit", limit.kind),
            });
        }
    }
    Ok(())
}

const KNOWN: [&str; 16] = [
    "RLIMIT_AS",
    "RLIMIT_CORE",
    "RLIMIT_CPU",
    "RLIMIT_DATA",
    "RLIMIT_FSIZE",
    "RLIMIT_LOCKS",
    "RLIMIT_MEMLOCK",
    "RLIMIT_MSGQUEUE",
    "RLIMIT_NICE",
    "RLIMIT_NOFILE",
    "RLIMIT_NPROC",
    "RLIMIT_RSS",
    "RLIMIT_RTPRIO",
    "RLIMIT_RTTIME",
    "RLIMIT_SIGPENDING",
    "RLIMIT_STACK",
];

/// Applies limits to the calling process. Runs in the child.
///
/// Limits must have passed [`validate`]; unknown names are skipped.
///
/// # Errors
///
/// Returns the `setrlimit(2)` error.
#[cfg(target_os = "linux")]
pub fn apply(limits: &[Rlimit]) -> std::io::Result<()> {
    for limit in limits {
        if let Some(resource) = resource(&limit.kind) {
            nix::sys::resource::setrlimit(resource, limit.soft, limit.hard)?;
        }
    }
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; rlimits are applied on Linux only.
#[cfg(not(target_os = "linux"))]
pub fn apply(_limits: &[Rlimit]) -> std::io::Result<()> {
    Err(crate::unsupported())
}

#[cfg(target_os = "linux")]
fn resource(name: &str) -> Option<nix::sys::resource::Resource> {
    use nix::sys::resource::Resource;

    let resource = match name.to_ascii_uppercase().as_str() {
        "RLIMIT_AS" => Resource::RLIMIT_AS,
        "RLIMIT_CORE" => Resource::RLIMIT_CORE,
        "RLIMIT_CPU" => Resource::RLIMIT_CPU,
        "RLIMIT_DATA" => Resource::RLIMIT_DATA,
        "RLIMIT_FSIZE" => Resource::RLIMIT_FSIZE,
        "RLIMIT_LOCKS" => Resource::RLIMIT_LOCKS,
        "RLIMIT_MEMLOCK" => Resource::RLIMIT_MEMLOCK,
        "RLIMIT_MSGQUEUE" => Resource::RLIMIT_MSGQUEUE,
        "RLIMIT_NICE" => Resource::RLIMIT_NICE,
        "RLIMIT_NOFILE" => Resource::RLIMIT_NOFILE,
        "RLIMIT_NPROC" => Resource::RLIMIT_NPROC,
        "RLIMIT_RSS" => Resource::RLIMIT_RSS,
        "RLIMIT_RTPRIO" => Resource::RLIMIT_RTPRIO,
        "RLIMIT_RTTIME" => Resource::RLIMIT_RTTIME,
        "RLIMIT_SIGPENDING" => Resource::RLIMIT_SIGPENDING,
        "RLIMIT_STACK" => Resource::RLIMIT_STACK,
        _ => return None,
    };
    Some(resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(kind: &str, soft: u64, hard: u64) -> Rlimit {
        Rlimit {
            kind: kind.into(),
            soft,
            hard,
        }
    }

    #[test]
    fn validate_accepts_known_limits() {
        assert!(validate(&[limit("RLIMIT_NOFILE", 1024, 4096), limit("rlimit_core", 0, 0)]).is_ok());
    }

    #[test]
    fn validate_rejects_unknown_and_inverted() {
        assert!(validate(&[limit("RLIMIT_WISHES", 1, 1)]).is_err());
        assert!(validate(&[limit("RLIMIT_NOFILE", 10, 5)]).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn every_known_name_maps_to_a_resource() {
        for name in KNOWN {
            assert!(resource(name).is_some(), "{name}");
        }
    }
}
