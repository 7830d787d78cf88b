//! Containerizer configuration flags.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent flags consumed by the Docker containerizer.
///
/// Every field has a working default so a bare `Flags::default()` drives a
/// stock Docker install; deployments override individual fields through the
/// agent's configuration file (humantime strings for the durations).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Flags {
    /// Path to the Docker CLI binary.
    pub docker: String,

    /// Grace period passed to `docker stop` during teardown.
    #[serde(with = "rmesos_spec::duration")]
    pub docker_stop_timeout: Duration,

    /// Delay before the destroyed container is `docker rm -f`'d.
    #[serde(with = "rmesos_spec::duration")]
    pub docker_remove_delay: Duration,

    /// Whether recovery stops live Mesos-named containers nobody claimed.
    pub docker_kill_orphans: bool,

    /// When set, the executor helper itself runs inside a Docker container
    /// using this image (the agent is assumed to be containerized too).
    pub docker_mesos_image: Option<String>,

    /// Docker daemon socket, mounted into the nested executor container.
    pub docker_socket: String,

    /// Path the sandbox is mapped to inside the container.
    pub docker_sandbox_directory: String,

    /// Agent work directory (sandbox layout and checkpoint root).
    pub work_dir: PathBuf,

    /// Directory holding the `mesos-docker-executor` helper binary.
    pub launcher_dir: PathBuf,

    /// How long a disconnected executor waits for the agent to come back.
    #[serde(with = "rmesos_spec::duration")]
    pub recovery_timeout: Duration,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            docker_stop_timeout: Duration::from_secs(0),
            docker_remove_delay: Duration::from_secs(6 * 60 * 60),
            docker_kill_orphans: true,
            docker_mesos_image: None,
            docker_socket: "/var/run/docker.sock".to_string(),
            docker_sandbox_directory: "/mnt/mesos/sandbox".to_string(),
            work_dir: PathBuf::from("/tmp/mesos"),
            launcher_dir: PathBuf::from("/usr/local/libexec/mesos"),
            recovery_timeout: Duration::from_secs(15 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let flags = Flags::default();
        assert_eq!(flags.docker, "docker");
        assert_eq!(flags.docker_stop_timeout, Duration::from_secs(0));
        assert_eq!(flags.docker_remove_delay, Duration::from_secs(21600));
        assert!(flags.docker_kill_orphans);
        assert!(flags.docker_mesos_image.is_none());
        assert_eq!(flags.docker_sandbox_directory, "/mnt/mesos/sandbox");
    }

    #[test]
    fn deserializes_humantime_durations() {
        let flags: Flags = serde_json::from_str(
            r#"{
                "docker": "/usr/bin/docker",
                "docker_stop_timeout": "30s",
                "docker_remove_delay": "1h",
                "docker_mesos_image": "rmesos/agent:0.3",
                "recovery_timeout": "10m"
            }"#,
        )
        .unwrap();

        assert_eq!(flags.docker, "/usr/bin/docker");
        assert_eq!(flags.docker_stop_timeout, Duration::from_secs(30));
        assert_eq!(flags.docker_remove_delay, Duration::from_secs(3600));
        assert_eq!(flags.docker_mesos_image.as_deref(), Some("rmesos/agent:0.3"));
        assert_eq!(flags.recovery_timeout, Duration::from_secs(600));
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = serde_json::from_str::<Flags>(r#"{"docker_socket_path": "/x"}"#);
        assert!(result.is_err());
    }
}
