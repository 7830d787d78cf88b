//! Checkpointed agent state
//!
//! The agent persists enough metadata under `<work_dir>/meta` to reconnect
//! with executors it forked before a restart. The containerizer consumes the
//! recovered `SlaveState` and writes one artifact of its own: the forked
//! helper pid of each launched executor.

use crate::error::{AgentError, Result};
use rmesos_spec::{ContainerId, ExecutorId, ExecutorInfo, FrameworkId, SlaveId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Recovered agent state, frameworks down to executor runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveState {
    pub id: SlaveId,
    #[serde(default)]
    pub frameworks: HashMap<FrameworkId, FrameworkState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkState {
    pub id: FrameworkId,
    #[serde(default)]
    pub executors: HashMap<ExecutorId, ExecutorState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorState {
    pub id: ExecutorId,
    /// Missing when the executor's info file could not be recovered.
    #[serde(default)]
    pub info: Option<ExecutorInfo>,
    /// The most recent run; earlier runs are already terminal.
    #[serde(default)]
    pub latest: Option<ContainerId>,
    #[serde(default)]
    pub runs: HashMap<ContainerId, RunState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub id: ContainerId,
    /// Pid of the forked executor helper, when it was checkpointed.
    #[serde(default)]
    pub forked_pid: Option<i32>,
    /// Set once the run's termination was acknowledged.
    #[serde(default)]
    pub completed: bool,
}

/// Root of the checkpointed metadata tree.
pub fn meta_root(work_dir: &Path) -> PathBuf {
    work_dir.join("meta")
}

/// Path of the forked-pid checkpoint for one executor run.
pub fn forked_pid_path(
    meta_root: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    container_id: &ContainerId,
) -> PathBuf {
    meta_root
        .join("slaves")
        .join(slave_id.as_str())
        .join("frameworks")
        .join(framework_id.as_str())
        .join("executors")
        .join(executor_id.as_str())
        .join("runs")
        .join(container_id.as_str())
        .join("pids")
        .join("forked.pid")
}

/// Checkpoint `content` at `path`, creating parent directories.
///
/// Written through a temporary sibling and renamed so a crash mid-write never
/// leaves a torn file for recovery to trip over.
pub async fn checkpoint(path: &Path, content: &str) -> Result<()> {
    let error = |e: std::io::Error| AgentError::Checkpoint {
        reason: format!("{}: {e}", path.display()),
    };

    let parent = path
        .parent()
        .ok_or_else(|| AgentError::Checkpoint {
            reason: format!("{} has no parent directory", path.display()),
        })?;
    tokio::fs::create_dir_all(parent).await.map_err(error)?;

    let temp = path.with_extension("tmp");
    tokio::fs::write(&temp, content).await.map_err(error)?;
    tokio::fs::rename(&temp, path).await.map_err(error)?;

    Ok(())
}

/// Read back a checkpointed forked pid. `None` when no checkpoint exists.
pub async fn read_forked_pid(path: &Path) -> Result<Option<i32>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(AgentError::Checkpoint {
                reason: format!("{}: {e}", path.display()),
            })
        }
    };

    content
        .trim()
        .parse::<i32>()
        .map(Some)
        .map_err(|e| AgentError::Checkpoint {
            reason: format!("malformed pid in {}: {e}", path.display()),
        })
}
