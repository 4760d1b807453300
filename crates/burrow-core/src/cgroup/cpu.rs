//! CPU resource control via cgroups v2.

use std::path::Path;

use burrow_common::error::Result;

/// Sets the CPU weight for a cgroup.
///
/// Weight is a value between 1 and 10000 that controls the relative
/// share of CPU time this cgroup receives under contention.
///
/// # Errors
///
/// Returns an error if writing to `cpu.weight` fails.
pub fn set_cpu_weight(cgroup_path: &Path, weight: u64) -> Result<()> {
    super::write_control(cgroup_path, "cpu.weight", &weight.clamp(1, 10_000).to_string())?;
    tracing::debug!(weight, "CPU weight set");
    Ok(())
}
