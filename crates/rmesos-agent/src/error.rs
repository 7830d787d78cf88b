//! Containerizer errors

use rmesos_spec::ContainerId;
use thiserror::Error;

/// Errors surfaced by the Docker containerizer
#[derive(Debug, Error)]
pub enum AgentError {
    /// A launch named a ContainerID that is already registered
    #[error("Container '{container}' already started")]
    AlreadyStarted { container: ContainerId },

    /// Operation on a container the registry does not know
    #[error("Unknown container: {container}")]
    UnknownContainer { container: ContainerId },

    /// Operation on a container that is being torn down
    #[error("Container is being removed: {container}")]
    BeingRemoved { container: ContainerId },

    /// A destroy raced the launch pipeline and won
    #[error("Container '{container}' was destroyed while {phase}")]
    DestroyedInFlight {
        container: ContainerId,
        phase: &'static str,
    },

    /// Sandbox preparation failed before the container was registered
    #[error("Failed to prepare sandbox: {reason}")]
    Sandbox { reason: String },

    /// Artifact download into the sandbox failed
    #[error("Failed to fetch URIs for container '{container}': {reason}")]
    Fetch {
        container: ContainerId,
        reason: String,
    },

    /// Image pull failed
    #[error("Failed to pull image '{image}': {reason}")]
    Pull { image: String, reason: String },

    /// `docker run` failed to start the container
    #[error("Failed to run container '{container}': {reason}")]
    Run {
        container: ContainerId,
        reason: String,
    },

    /// Launching the executor helper failed
    #[error("Failed to launch executor for container '{container}': {reason}")]
    Launch {
        container: ContainerId,
        reason: String,
    },

    /// Persisting the forked helper pid failed
    #[error("Failed to checkpoint executor's pid: {reason}")]
    Checkpoint { reason: String },

    /// A Docker CLI invocation failed
    #[error("Docker error: {0}")]
    Docker(String),

    /// A cgroup lookup or control-file write failed
    #[error("Failed to update cgroups: {reason}")]
    Cgroup { reason: String },

    /// Resource usage sampling failed
    #[error("Failed to sample resource usage: {reason}")]
    Usage { reason: String },

    /// Reconciling persisted runs with live containers failed
    #[error("Container recovery failed: {reason}")]
    Recovery { reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
