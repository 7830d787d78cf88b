//! Abstract Docker client interface
//!
//! Defines the `DockerClient` trait covering the CLI operations the
//! containerizer consumes, so tests can supply a deterministic double.

mod cli;

pub use cli::CliDocker;

use crate::error::{AgentError, Result};
use rmesos_spec::{CommandInfo, ContainerInfo, Resources};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// A container as reported by `docker ps` / `docker inspect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerContainer {
    /// Docker's own container id (the hash).
    pub id: String,
    /// Container name, without the leading slash.
    pub name: String,
    /// Pid of the container's init process; `None` when not running.
    pub pid: Option<i32>,
}

/// Image metadata returned by a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerImage {
    pub id: String,
}

/// Docker operations the containerizer depends on.
///
/// `run` starts the container detached and resolves once it is up; container
/// output reaches the sandbox through `logs`. `docker wait` is deliberately
/// absent: the nested-launch path needs the wait as a reapable subprocess, so
/// it is spawned by the launcher instead.
#[async_trait::async_trait]
pub trait DockerClient: Send + Sync {
    /// Start a container named `name` from `container`/`command`, with the
    /// sandbox mounted at `mapped_directory`.
    async fn run(
        &self,
        container: &ContainerInfo,
        command: &CommandInfo,
        name: &str,
        sandbox: &Path,
        mapped_directory: &str,
        resources: Option<&Resources>,
        environment: &HashMap<String, String>,
    ) -> Result<()>;

    /// Stop a container, waiting up to `timeout` before Docker kills it.
    /// When `remove` is set the container is force-removed afterwards.
    async fn stop(&self, name: &str, timeout: Duration, remove: bool) -> Result<()>;

    /// Remove a container.
    async fn rm(&self, name: &str, force: bool) -> Result<()>;

    /// List containers, optionally restricted to names starting with
    /// `prefix`. `all` includes stopped containers.
    async fn ps(&self, all: bool, prefix: Option<&str>) -> Result<Vec<DockerContainer>>;

    /// Inspect a single container.
    async fn inspect(&self, name: &str) -> Result<DockerContainer>;

    /// Pull an image, running from `directory` so registry credentials placed
    /// in the sandbox are honored. No-op when the image is present unless
    /// `force` is set.
    async fn pull(&self, directory: &Path, image: &str, force: bool) -> Result<DockerImage>;

    /// Attach the container's log stream to the sandbox `stdout`/`stderr`
    /// files. Resolves once streaming is set up, not when it finishes.
    async fn logs(&self, name: &str, directory: &Path) -> Result<()>;
}

/// In-memory mock client for tests.
///
/// Records every invocation and keeps a name-keyed container table. Failure
/// injection and a pull gate let tests drive the destroy-races-launch paths.
#[derive(Default)]
pub struct MockDocker {
    state: std::sync::Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, DockerContainer>,
    calls: Vec<String>,
    next_pid: i32,
    fail_run: Option<String>,
    fail_pull: Option<String>,
    fail_stop: Option<(String, String)>,
    pull_gate: Option<std::sync::Arc<tokio::sync::Notify>>,
}

impl MockDocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a live container, as recovery tests need.
    pub fn add_container(&self, name: &str, pid: Option<i32>) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(
            name.to_string(),
            DockerContainer {
                id: format!("mock-{name}"),
                name: name.to_string(),
                pid,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().unwrap().containers.contains_key(name)
    }

    /// Every call recorded so far, e.g. `"run mesos-s1.c1"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_next_run(&self, reason: &str) {
        self.state.lock().unwrap().fail_run = Some(reason.to_string());
    }

    pub fn fail_next_pull(&self, reason: &str) {
        self.state.lock().unwrap().fail_pull = Some(reason.to_string());
    }

    /// Fail the next `stop` of this specific container.
    pub fn fail_next_stop(&self, name: &str, reason: &str) {
        self.state.lock().unwrap().fail_stop = Some((name.to_string(), reason.to_string()));
    }

    /// Make the next `pull` block until the returned handle is notified.
    pub fn gate_pulls(&self) -> std::sync::Arc<tokio::sync::Notify> {
        let gate = std::sync::Arc::new(tokio::sync::Notify::new());
        self.state.lock().unwrap().pull_gate = Some(gate.clone());
        gate
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait::async_trait]
impl DockerClient for MockDocker {
    async fn run(
        &self,
        _container: &ContainerInfo,
        _command: &CommandInfo,
        name: &str,
        _sandbox: &Path,
        _mapped_directory: &str,
        _resources: Option<&Resources>,
        _environment: &HashMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("run {name}"));

        if let Some(reason) = state.fail_run.take() {
            return Err(AgentError::Docker(reason));
        }

        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.containers.insert(
            name.to_string(),
            DockerContainer {
                id: format!("mock-{name}"),
                name: name.to_string(),
                pid: Some(pid),
            },
        );
        Ok(())
    }

    async fn stop(&self, name: &str, timeout: Duration, remove: bool) -> Result<()> {
        let fail = {
            let mut state = self.state.lock().unwrap();
            state
                .calls
                .push(format!("stop {name} {}s remove={remove}", timeout.as_secs()));
            let targeted = state
                .fail_stop
                .as_ref()
                .map_or(false, |(target, _)| target == name);
            if targeted {
                state.fail_stop.take().map(|(_, reason)| reason)
            } else {
                None
            }
        };

        if let Some(reason) = fail {
            return Err(AgentError::Docker(reason));
        }

        let mut state = self.state.lock().unwrap();
        if remove {
            state.containers.remove(name);
        } else if let Some(container) = state.containers.get_mut(name) {
            container.pid = None;
        }
        Ok(())
    }

    async fn rm(&self, name: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("rm force={force} {name}"));
        state.containers.remove(name);
        Ok(())
    }

    async fn ps(&self, _all: bool, prefix: Option<&str>) -> Result<Vec<DockerContainer>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .values()
            .filter(|c| prefix.map_or(true, |p| c.name.starts_with(p)))
            .cloned()
            .collect())
    }

    async fn inspect(&self, name: &str) -> Result<DockerContainer> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::Docker(format!("No such container: {name}")))
    }

    async fn pull(&self, _directory: &Path, image: &str, force: bool) -> Result<DockerImage> {
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("pull {image} force={force}"));
            state.pull_gate.take()
        };

        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(reason) = self.state.lock().unwrap().fail_pull.take() {
            return Err(AgentError::Docker(reason));
        }

        Ok(DockerImage {
            id: image.to_string(),
        })
    }

    async fn logs(&self, name: &str, _directory: &Path) -> Result<()> {
        self.record(format!("logs {name}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmesos_spec::ContainerInfo;

    #[tokio::test]
    async fn mock_tracks_container_lifecycle() {
        let docker = MockDocker::new();
        let info = ContainerInfo::docker("busybox");
        let command = CommandInfo::default();

        docker
            .run(
                &info,
                &command,
                "mesos-s1.c1",
                Path::new("/tmp/sandbox"),
                "/mnt/mesos/sandbox",
                None,
                &HashMap::new(),
            )
            .await
            .unwrap();

        let inspected = docker.inspect("mesos-s1.c1").await.unwrap();
        assert!(inspected.pid.is_some());

        docker
            .stop("mesos-s1.c1", Duration::from_secs(0), false)
            .await
            .unwrap();
        let stopped = docker.inspect("mesos-s1.c1").await.unwrap();
        assert_eq!(stopped.pid, None);

        docker.rm("mesos-s1.c1", true).await.unwrap();
        assert!(docker.inspect("mesos-s1.c1").await.is_err());

        let calls = docker.calls();
        assert_eq!(calls[0], "run mesos-s1.c1");
        assert_eq!(calls[1], "stop mesos-s1.c1 0s remove=false");
    }

    #[tokio::test]
    async fn ps_filters_on_prefix() {
        let docker = MockDocker::new();
        docker.add_container("mesos-s1.a", Some(11));
        docker.add_container("mesos-s2.b", Some(12));
        docker.add_container("registry", Some(13));

        let matching = docker.ps(true, Some("mesos-s1")).await.unwrap();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].name, "mesos-s1.a");

        let all = docker.ps(true, None).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
