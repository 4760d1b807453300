//! UTS namespace: the container's own hostname.

/// Sets the hostname inside the UTS namespace. Runs in the child.
///
/// An empty name leaves the inherited hostname in place.
///
/// # Errors
///
/// Returns the `sethostname(2)` error.
#[cfg(target_os = "linux")]
pub fn set_hostname(hostname: &str) -> std::io::Result<()> {
    if hostname.is_empty() {
        return Ok(());
    }
    nix::unistd::sethostname(hostname)?;
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; UTS namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_hostname(_hostname: &str) -> std::io::Result<()> {
    Err(crate::unsupported())
}
