//! Docker CLI client
//!
//! Drives the Docker daemon through the `docker` binary. The containerizer
//! shares the host daemon with everything else on the node, so every
//! operation shells out rather than holding a connection.

use super::{DockerClient, DockerContainer, DockerImage};
use crate::cgroups::{CPU_SHARES_PER_CPU, MIN_CPU_SHARES, MIN_MEMORY_BYTES};
use crate::error::{AgentError, Result};
use rmesos_spec::{CommandInfo, ContainerInfo, DockerNetwork, Resources, VolumeMode};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Docker client backed by the CLI binary at a configured path.
#[derive(Debug, Clone)]
pub struct CliDocker {
    path: String,
}

impl CliDocker {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Create a client and verify the daemon is reachable.
    pub async fn connect(path: impl Into<String>) -> Result<Self> {
        let docker = Self::new(path);
        let version = docker.output(&["version", "--format", "{{.Server.Version}}"], None).await?;
        tracing::info!(version = %version.trim(), "Connected to Docker daemon");
        Ok(docker)
    }

    /// Run the CLI with `args`, returning stdout or the failure's stderr.
    async fn output(&self, args: &[&str], current_dir: Option<&Path>) -> Result<String> {
        let mut command = Command::new(&self.path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = current_dir {
            command.current_dir(dir);
        }

        debug!(docker = %self.path, ?args, "Invoking docker CLI");

        let output = command
            .output()
            .await
            .map_err(|e| AgentError::Docker(format!("failed to execute '{}': {e}", self.path)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Docker(format!(
                "'{} {}' exited with {}: {}",
                self.path,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Build the argument vector for `docker run`.
fn run_args(
    container: &ContainerInfo,
    command: &CommandInfo,
    name: &str,
    sandbox: &Path,
    mapped_directory: &str,
    resources: Option<&Resources>,
    environment: &HashMap<String, String>,
) -> Result<Vec<String>> {
    let docker_info = container
        .docker
        .as_ref()
        .ok_or_else(|| AgentError::Docker("No docker info found in container info".to_string()))?;

    let mut args = vec!["run".to_string(), "-d".to_string()];

    if docker_info.privileged {
        args.push("--privileged".to_string());
    }

    match docker_info.network {
        DockerNetwork::Host => args.push("--net=host".to_string()),
        DockerNetwork::Bridge => args.push("--net=bridge".to_string()),
        DockerNetwork::None => args.push("--net=none".to_string()),
    }

    if let Some(resources) = resources {
        if let Some(cpus) = resources.cpus {
            let shares = ((CPU_SHARES_PER_CPU as f64 * cpus) as u64).max(MIN_CPU_SHARES);
            args.push(format!("--cpu-shares={shares}"));
        }
        if let Some(mem) = resources.mem_bytes {
            args.push(format!("--memory={}", mem.max(MIN_MEMORY_BYTES)));
        }
    }

    // Sorted for a deterministic command line.
    let mut env: Vec<(&String, &String)> = environment.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push("-e".to_string());
    args.push(format!("MESOS_SANDBOX={mapped_directory}"));

    for volume in &container.volumes {
        let mode = match volume.mode {
            VolumeMode::Ro => "ro",
            VolumeMode::Rw => "rw",
        };
        let spec = match &volume.host_path {
            Some(host) => format!("{host}:{}:{mode}", volume.container_path),
            None => volume.container_path.clone(),
        };
        args.push("-v".to_string());
        args.push(spec);
    }

    args.push("-v".to_string());
    args.push(format!("{}:{mapped_directory}:rw", sandbox.display()));

    args.push(format!("--name={name}"));
    args.push(docker_info.image.clone());

    if command.shell {
        let value = command
            .value
            .as_ref()
            .ok_or_else(|| AgentError::Docker("Shell specified but no command value".to_string()))?;
        args.push("/bin/sh".to_string());
        args.push("-c".to_string());
        args.push(value.clone());
    } else {
        if let Some(value) = &command.value {
            args.push(value.clone());
        }
        args.extend(command.arguments.iter().cloned());
    }

    Ok(args)
}

/// One entry of `docker inspect` output.
#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Pid")]
    pid: i32,
    #[serde(rename = "Running")]
    running: bool,
}

fn parse_inspect(json: &str) -> Result<DockerContainer> {
    let entries: Vec<InspectEntry> = serde_json::from_str(json)
        .map_err(|e| AgentError::Docker(format!("failed to parse inspect output: {e}")))?;

    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::Docker("inspect returned no containers".to_string()))?;

    let pid = (entry.state.running && entry.state.pid > 0).then_some(entry.state.pid);

    Ok(DockerContainer {
        id: entry.id,
        name: entry.name.trim_start_matches('/').to_string(),
        pid,
    })
}

#[async_trait::async_trait]
impl DockerClient for CliDocker {
    async fn run(
        &self,
        container: &ContainerInfo,
        command: &CommandInfo,
        name: &str,
        sandbox: &Path,
        mapped_directory: &str,
        resources: Option<&Resources>,
        environment: &HashMap<String, String>,
    ) -> Result<()> {
        let args = run_args(
            container,
            command,
            name,
            sandbox,
            mapped_directory,
            resources,
            environment,
        )?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.output(&args, None).await?;
        Ok(())
    }

    async fn stop(&self, name: &str, timeout: Duration, remove: bool) -> Result<()> {
        let time = format!("--time={}", timeout.as_secs());
        self.output(&["stop", &time, name], None).await?;
        if remove {
            self.rm(name, true).await?;
        }
        Ok(())
    }

    async fn rm(&self, name: &str, force: bool) -> Result<()> {
        if force {
            self.output(&["rm", "--force", name], None).await?;
        } else {
            self.output(&["rm", name], None).await?;
        }
        Ok(())
    }

    async fn ps(&self, all: bool, prefix: Option<&str>) -> Result<Vec<DockerContainer>> {
        let mut args = vec!["ps", "--no-trunc", "--format", "{{.Names}}"];
        if all {
            args.insert(1, "--all");
        }

        let stdout = self.output(&args, None).await?;

        let mut containers = Vec::new();
        for name in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if prefix.map_or(false, |p| !name.starts_with(p)) {
                continue;
            }
            // A container can disappear between the listing and the inspect.
            match self.inspect(name).await {
                Ok(container) => containers.push(container),
                Err(e) => warn!(container = %name, error = %e, "Skipping unlistable container"),
            }
        }

        Ok(containers)
    }

    async fn inspect(&self, name: &str) -> Result<DockerContainer> {
        let stdout = self.output(&["inspect", name], None).await?;
        parse_inspect(&stdout)
    }

    async fn pull(&self, directory: &Path, image: &str, force: bool) -> Result<DockerImage> {
        if !force {
            if let Ok(stdout) = self
                .output(&["inspect", "--format={{.Id}}", "--type=image", image], None)
                .await
            {
                let id = stdout.trim();
                if !id.is_empty() {
                    debug!(image, "Image already present, skipping pull");
                    return Ok(DockerImage { id: id.to_string() });
                }
            }
        }

        self.output(&["pull", image], Some(directory))
            .await
            .map_err(|e| AgentError::Pull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;

        let stdout = self
            .output(&["inspect", "--format={{.Id}}", "--type=image", image], None)
            .await?;
        Ok(DockerImage {
            id: stdout.trim().to_string(),
        })
    }

    async fn logs(&self, name: &str, directory: &Path) -> Result<()> {
        let open = |file: &str| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(directory.join(file))
        };

        let stdout = open("stdout").map_err(|e| {
            AgentError::Docker(format!("failed to open sandbox stdout for logs: {e}"))
        })?;
        let stderr = open("stderr").map_err(|e| {
            AgentError::Docker(format!("failed to open sandbox stderr for logs: {e}"))
        })?;

        let mut child = Command::new(&self.path)
            .args(["logs", "--follow", name])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| AgentError::Docker(format!("failed to spawn docker logs: {e}")))?;

        // The follower lives until the container stops; reap it in the
        // background so it never turns into a zombie.
        let name = name.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(container = %name, %status, "docker logs exited"),
                Err(e) => warn!(container = %name, error = %e, "failed to wait on docker logs"),
            }
        });

        Ok(())
    }
}
