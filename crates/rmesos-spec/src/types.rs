//! Core message types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Serde helpers for human-readable durations ("30s", "6h", "15m").
pub mod duration {
    use humantime::format_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let s: String = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(|e| D::Error::custom(format!("invalid duration: {}", e)))
    }

    /// Serde module for `Option<Duration>` fields.
    pub mod option {
        use humantime::format_duration;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_str(&format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            use serde::de::Error;
            let s: Option<String> = Option::deserialize(deserializer)?;
            match s {
                Some(s) => humantime::parse_duration(&s)
                    .map(Some)
                    .map_err(|e| D::Error::custom(format!("invalid duration: {}", e))),
                None => Ok(None),
            }
        }
    }
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id! {
    /// Opaque container identifier. Minted by the caller; uniqueness is the
    /// caller's responsibility.
    ContainerId
}

string_id! {
    /// Identity of the agent ("slave") that owns a container.
    SlaveId
}

string_id! {
    /// Framework identifier assigned by the master.
    FrameworkId
}

string_id! {
    /// Executor identifier, unique within a framework.
    ExecutorId
}

string_id! {
    /// Task identifier, unique within a framework.
    TaskId
}

/// A fetchable artifact named by a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandUri {
    pub value: String,
    #[serde(default)]
    pub executable: bool,
    #[serde(default)]
    pub extract: bool,
}

/// Command to run inside (or alongside) a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Shell command line, or the executable path when `shell` is false.
    #[serde(default)]
    pub value: Option<String>,
    /// Arguments for the non-shell form.
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "default_true")]
    pub shell: bool,
    /// Environment variables supplied by the framework.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Artifacts to place in the sandbox before the command starts.
    #[serde(default)]
    pub uris: Vec<CommandUri>,
}

impl Default for CommandInfo {
    fn default() -> Self {
        Self {
            value: None,
            arguments: Vec::new(),
            shell: true,
            environment: HashMap::new(),
            uris: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Volume mount access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolumeMode {
    Ro,
    Rw,
}

/// A host path mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    #[serde(default)]
    pub host_path: Option<String>,
    pub container_path: String,
    pub mode: VolumeMode,
}

/// Container network mode, passed through to Docker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DockerNetwork {
    Host,
    #[default]
    Bridge,
    None,
}

/// Docker-specific container configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerInfo {
    pub image: String,
    #[serde(default)]
    pub network: DockerNetwork,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub force_pull_image: bool,
}

impl DockerInfo {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            network: DockerNetwork::default(),
            privileged: false,
            force_pull_image: false,
        }
    }
}

/// Which containerizer a container is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Docker,
    Mesos,
}

/// Container configuration carried by a task or executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(rename = "type")]
    pub type_: ContainerType,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub docker: Option<DockerInfo>,
}

impl ContainerInfo {
    /// A Docker container description for the given image.
    pub fn docker(image: impl Into<String>) -> Self {
        Self {
            type_: ContainerType::Docker,
            volumes: Vec::new(),
            docker: Some(DockerInfo::new(image)),
        }
    }
}

/// Resource allocation for a container: fractional CPUs and memory in bytes.
///
/// Only the resources the Docker containerizer acts on are modeled; anything
/// else a framework declares is carried by the scheduler, not by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub mem_bytes: Option<u64>,
}

impl Resources {
    pub fn new(cpus: Option<f64>, mem_bytes: Option<u64>) -> Self {
        Self { cpus, mem_bytes }
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.mem_bytes.is_none()
    }
}

/// A task to run, optionally inside a container of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub name: String,
    pub task_id: TaskId,
    pub slave_id: SlaveId,
    #[serde(default)]
    pub command: Option<CommandInfo>,
    #[serde(default)]
    pub container: Option<ContainerInfo>,
    #[serde(default)]
    pub resources: Resources,
}

/// A framework-supplied executor description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    pub framework_id: FrameworkId,
    #[serde(default)]
    pub command: CommandInfo,
    #[serde(default)]
    pub container: Option<ContainerInfo>,
    #[serde(default)]
    pub resources: Resources,
}

/// Point-in-time resource usage of a container, as reported by `usage()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatistics {
    /// Seconds since the epoch at which the sample was taken.
    pub timestamp: f64,
    #[serde(default)]
    pub cpus_limit: Option<f64>,
    #[serde(default)]
    pub cpus_user_time_secs: Option<f64>,
    #[serde(default)]
    pub cpus_system_time_secs: Option<f64>,
    #[serde(default)]
    pub mem_limit_bytes: Option<u64>,
    #[serde(default)]
    pub mem_rss_bytes: Option<u64>,
}

/// Delivered once per container when it is destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    /// Whether the container was actively killed (as opposed to the executor
    /// exiting on its own).
    pub killed: bool,
    /// Exit status of the reaped executor, when one could be collected.
    #[serde(default)]
    pub status: Option<i32>,
    pub message: String,
}
