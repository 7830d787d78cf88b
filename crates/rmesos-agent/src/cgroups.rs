//! Cgroup v1 limit updates
//!
//! Docker places each container's init process in per-subsystem cgroups; a
//! resource update rewrites the control files of whatever cgroup the pid is
//! currently in. Hierarchy mount points are discovered once per process.

use crate::error::{AgentError, Result};
use rmesos_spec::ContainerId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

/// cpu.shares granted per requested CPU.
pub const CPU_SHARES_PER_CPU: u64 = 1024;

/// Floor for cpu.shares; the kernel misbehaves below this.
pub const MIN_CPU_SHARES: u64 = 10;

/// Floor for the memory limit.
pub const MIN_MEMORY_BYTES: u64 = 32 * 1024 * 1024;

/// Mount point of the hierarchy a subsystem is attached to, memoized for the
/// life of the process. `None` when the subsystem is not mounted (cgroup v2
/// hosts, non-Linux).
pub fn hierarchy(subsystem: &str) -> Option<&'static Path> {
    static HIERARCHIES: OnceLock<HashMap<String, PathBuf>> = OnceLock::new();

    HIERARCHIES
        .get_or_init(|| {
            let mounts = std::fs::read_to_string("/proc/mounts").unwrap_or_default();
            parse_mounts(&mounts)
        })
        .get(subsystem)
        .map(PathBuf::as_path)
}

/// Parse `/proc/mounts` content into subsystem → hierarchy mount point.
fn parse_mounts(content: &str) -> HashMap<String, PathBuf> {
    let mut hierarchies = HashMap::new();

    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        let (Some(mount_point), Some("cgroup"), Some(options)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        for option in options.split(',') {
            // Mount options mix subsystem names with flags like rw/noexec;
            // recording all of them is harmless since lookups are by
            // subsystem name.
            hierarchies
                .entry(option.to_string())
                .or_insert_with(|| PathBuf::from(mount_point));
        }
    }

    hierarchies
}

/// The cgroup (relative to its hierarchy) a pid belongs to within a
/// subsystem, read from `/proc/<pid>/cgroup`.
pub fn cgroup_of(pid: i32, subsystem: &str) -> Result<Option<String>> {
    let path = format!("/proc/{pid}/cgroup");
    let content = std::fs::read_to_string(&path).map_err(|e| AgentError::Cgroup {
        reason: format!("failed to read {path}: {e}"),
    })?;
    Ok(parse_proc_cgroup(&content, subsystem))
}

/// Parse `/proc/<pid>/cgroup` lines of the form `4:cpu,cpuacct:/docker/abc`.
fn parse_proc_cgroup(content: &str, subsystem: &str) -> Option<String> {
    for line in content.lines() {
        let mut fields = line.splitn(3, ':');
        let _id = fields.next()?;
        let subsystems = fields.next()?;
        let cgroup = fields.next()?;

        if subsystems.split(',').any(|s| s == subsystem) {
            return Some(cgroup.to_string());
        }
    }
    None
}

fn control_path(hierarchy: &Path, cgroup: &str, control: &str) -> PathBuf {
    hierarchy
        .join(cgroup.trim_start_matches('/'))
        .join(control)
}

async fn write_control(hierarchy: &Path, cgroup: &str, control: &str, value: u64) -> Result<()> {
    let path = control_path(hierarchy, cgroup, control);
    tokio::fs::write(&path, value.to_string())
        .await
        .map_err(|e| AgentError::Cgroup {
            reason: format!("failed to write '{control}' at {}: {e}", path.display()),
        })
}

async fn read_control(hierarchy: &Path, cgroup: &str, control: &str) -> Result<u64> {
    let path = control_path(hierarchy, cgroup, control);
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| AgentError::Cgroup {
            reason: format!("failed to read '{control}' at {}: {e}", path.display()),
        })?;
    content.trim().parse().map_err(|e| AgentError::Cgroup {
        reason: format!("malformed '{control}' at {}: {e}", path.display()),
    })
}

/// Write cpu.shares for a cpus allocation; returns the shares written.
pub async fn apply_cpu_shares(hierarchy: &Path, cgroup: &str, cpus: f64) -> Result<u64> {
    let shares = ((CPU_SHARES_PER_CPU as f64 * cpus) as u64).max(MIN_CPU_SHARES);
    write_control(hierarchy, cgroup, "cpu.shares", shares).await?;
    Ok(shares)
}

/// Apply a memory allocation; returns the effective limit.
///
/// The soft limit is always written. The hard limit is raised when the new
/// limit exceeds the current one and left alone otherwise: lowering it under
/// a running task would invite the kernel OOM killer.
pub async fn apply_memory_limits(hierarchy: &Path, cgroup: &str, mem_bytes: u64) -> Result<u64> {
    let limit = mem_bytes.max(MIN_MEMORY_BYTES);

    write_control(hierarchy, cgroup, "memory.soft_limit_in_bytes", limit).await?;

    let current = read_control(hierarchy, cgroup, "memory.limit_in_bytes").await?;
    if limit > current {
        write_control(hierarchy, cgroup, "memory.limit_in_bytes", limit).await?;
    }

    Ok(limit)
}

/// Apply a resource allocation to the cgroups of a container's init pid.
///
/// A subsystem the pid is not a member of is skipped with a warning; the
/// other subsystem is still updated. Missing hierarchies (cgroup v2-only
/// hosts) skip the same way.
pub async fn update_limits(
    container_id: &ContainerId,
    pid: i32,
    cpus: Option<f64>,
    mem_bytes: Option<u64>,
) -> Result<()> {
    if let Some(cpus) = cpus {
        match (hierarchy("cpu"), cgroup_of(pid, "cpu")?) {
            (Some(hierarchy), Some(cgroup)) => {
                let shares = apply_cpu_shares(hierarchy, &cgroup, cpus).await?;
                info!(
                    container = %container_id,
                    shares,
                    cgroup = %cgroup,
                    "Updated 'cpu.shares'"
                );
            }
            (None, _) => warn!(
                container = %container_id,
                "No hierarchy found for the 'cpu' subsystem, skipping cpu update"
            ),
            (_, None) => warn!(
                container = %container_id,
                "Container does not appear to be a member of a 'cpu' cgroup"
            ),
        }
    }

    if let Some(mem_bytes) = mem_bytes {
        match (hierarchy("memory"), cgroup_of(pid, "memory")?) {
            (Some(hierarchy), Some(cgroup)) => {
                let limit = apply_memory_limits(hierarchy, &cgroup, mem_bytes).await?;
                info!(
                    container = %container_id,
                    limit,
                    cgroup = %cgroup,
                    "Updated memory limits"
                );
            }
            (None, _) => warn!(
                container = %container_id,
                "No hierarchy found for the 'memory' subsystem, skipping memory update"
            ),
            (_, None) => warn!(
                container = %container_id,
                "Container does not appear to be a member of a 'memory' cgroup"
            ),
        }
    }

    Ok(())
}
