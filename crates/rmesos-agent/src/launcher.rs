//! Executor helper launching
//!
//! Two strategies exist for starting `mesos-docker-executor`. Normally it is
//! forked locally: the child is placed in its own session with the sandbox as
//! its working directory, and blocks on a one-byte stdin handshake until the
//! agent has checkpointed its pid. When the agent itself runs inside Docker
//! (`docker_mesos_image` set), forked children would die with the agent, so
//! the helper is started in a Docker container of its own and its liveness is
//! tracked by reaping a spawned `docker wait` subprocess.

use crate::config::Flags;
use crate::docker::DockerClient;
use crate::error::{AgentError, Result};
use crate::reaper::{self, StatusRx};
use rmesos_spec::{
    CommandInfo, ContainerId, ContainerInfo, ContainerType, DockerInfo, ExecutorInfo, SlaveId,
    Volume, VolumeMode,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tracing::{debug, info};

/// Name of the helper binary under `launcher_dir`.
pub const EXECUTOR_BINARY: &str = "mesos-docker-executor";

/// Everything a launcher needs to start the helper for one container.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub container_id: ContainerId,
    pub container_name: String,
    pub executor_container_name: String,
    pub directory: PathBuf,
    pub environment: HashMap<String, String>,
}

/// A started (but possibly not yet released) executor helper.
pub struct LaunchedExecutor {
    /// Pid to checkpoint and reap: the forked helper locally, the `docker
    /// wait` stand-in when nested.
    pub pid: i32,
    /// Resolves when the helper (or its stand-in) exits.
    pub status: StatusRx,
    stdin: Option<ChildStdin>,
}

impl LaunchedExecutor {
    /// Release the handshake: the helper proceeds to exec. Local launches
    /// only; a no-op for the nested variant.
    pub async fn confirm(&mut self) -> std::io::Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
        }
        Ok(())
    }

    /// Close the handshake pipe without writing; the helper aborts instead
    /// of starting. Used when checkpointing its pid failed.
    pub fn abandon(&mut self) {
        self.stdin.take();
    }
}

/// Seam for starting and re-attaching executor helpers.
#[async_trait::async_trait]
pub trait ExecutorLauncher: Send + Sync {
    /// Start the helper for a freshly launched container.
    async fn launch(&self, context: LaunchContext) -> Result<LaunchedExecutor>;

    /// Re-attach to a surviving executor container after an agent restart by
    /// spawning a reapable `docker wait` on it.
    async fn reattach(&self, executor_container_name: &str) -> Result<LaunchedExecutor>;
}

/// Environment the agent hands to an executor.
///
/// Framework-supplied variables win over the agent's own, and `GLOG_v` is
/// passed through so executor logging can be cranked up alongside the
/// agent's.
pub fn executor_environment(
    flags: &Flags,
    executor: &ExecutorInfo,
    directory: &Path,
    slave_id: &SlaveId,
    slave_pid: &str,
    checkpoint: bool,
) -> HashMap<String, String> {
    let mut environment = HashMap::new();

    environment.insert(
        "MESOS_FRAMEWORK_ID".to_string(),
        executor.framework_id.to_string(),
    );
    environment.insert(
        "MESOS_EXECUTOR_ID".to_string(),
        executor.executor_id.to_string(),
    );
    environment.insert(
        "MESOS_DIRECTORY".to_string(),
        directory.display().to_string(),
    );
    environment.insert("MESOS_SLAVE_ID".to_string(), slave_id.to_string());
    environment.insert("MESOS_SLAVE_PID".to_string(), slave_pid.to_string());
    environment.insert(
        "MESOS_CHECKPOINT".to_string(),
        if checkpoint { "1" } else { "0" }.to_string(),
    );
    if checkpoint {
        environment.insert(
            "MESOS_RECOVERY_TIMEOUT".to_string(),
            humantime::format_duration(flags.recovery_timeout).to_string(),
        );
    }

    for (key, value) in &executor.command.environment {
        environment.insert(key.clone(), value.clone());
    }

    if let Ok(glog) = std::env::var("GLOG_v") {
        environment.insert("GLOG_v".to_string(), glog);
    }

    environment
}

/// Container description for running the helper nested in Docker: the
/// daemon socket mounted read-only so the helper can drive the host daemon,
/// and the sandbox read-write so its logs survive container failures.
fn nested_container_info(flags: &Flags, directory: &Path) -> ContainerInfo {
    let image = flags
        .docker_mesos_image
        .clone()
        .unwrap_or_default();

    ContainerInfo {
        type_: ContainerType::Docker,
        volumes: vec![
            Volume {
                host_path: Some(flags.docker_socket.clone()),
                container_path: flags.docker_socket.clone(),
                mode: VolumeMode::Ro,
            },
            Volume {
                host_path: Some(directory.display().to_string()),
                container_path: directory.display().to_string(),
                mode: VolumeMode::Rw,
            },
        ],
        docker: Some(DockerInfo::new(image)),
    }
}

/// Spawn `docker wait` on a container as a subprocess whose exit mirrors the
/// container's, giving the reaper a pid to watch.
fn spawn_wait_process(docker: &str, name: &str) -> Result<LaunchedExecutor> {
    let script = format!("exit `{docker} wait {name}`");

    debug!(command = %script, "Launching wait process");

    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(&script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            AgentError::Internal(format!("Unable to launch docker wait on executor: {e}"))
        })?;

    let pid = child.id().ok_or_else(|| {
        AgentError::Internal("wait process exited before its pid was known".to_string())
    })? as i32;

    Ok(LaunchedExecutor {
        pid,
        status: reaper::watch_child(child),
        stdin: None,
    })
}

/// The real launcher, backed by fork/exec and the Docker CLI.
pub struct SubprocessLauncher {
    flags: Arc<Flags>,
    docker: Arc<dyn DockerClient>,
}

impl SubprocessLauncher {
    pub fn new(flags: Arc<Flags>, docker: Arc<dyn DockerClient>) -> Self {
        Self { flags, docker }
    }

    async fn launch_local(&self, context: LaunchContext) -> Result<LaunchedExecutor> {
        let helper = self.flags.launcher_dir.join(EXECUTOR_BINARY);
        let launch_error = |reason: String| AgentError::Launch {
            container: context.container_id.clone(),
            reason,
        };

        let open = |file: &str| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(context.directory.join(file))
        };
        let stdout = open("stdout")
            .map_err(|e| launch_error(format!("failed to open sandbox stdout: {e}")))?;
        let stderr = open("stderr")
            .map_err(|e| launch_error(format!("failed to open sandbox stderr: {e}")))?;

        info!(
            container = %context.container_id,
            helper = %helper.display(),
            "Launching docker executor"
        );

        // The shim blocks on stdin until the agent has checkpointed the pid;
        // a closed pipe aborts instead of starting the executor. exec keeps
        // the checkpointed pid pointing at the helper itself.
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(r#"read REPLY || exit 64; exec "$0" "$@""#)
            .arg(&helper)
            .arg(format!("--docker={}", self.flags.docker))
            .arg(format!("--container={}", context.container_name))
            .current_dir(&context.directory)
            .env_clear()
            .envs(&context.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        // Its own session keeps an agent SIGKILL/SIGTERM from taking the
        // executor down with it.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| launch_error(format!("failed to fork executor: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| launch_error("executor exited before its pid was known".to_string()))?
            as i32;
        let stdin = child.stdin.take();

        Ok(LaunchedExecutor {
            pid,
            status: reaper::watch_child(child),
            stdin,
        })
    }

    async fn launch_in_container(&self, context: LaunchContext) -> Result<LaunchedExecutor> {
        let helper = self.flags.launcher_dir.join(EXECUTOR_BINARY);

        let command_line = format!(
            "{} --docker={} --container={} --sandbox_directory={} --mapped_directory={}",
            helper.display(),
            self.flags.docker,
            context.container_name,
            context.directory.display(),
            self.flags.docker_sandbox_directory
        );

        info!(
            container = %context.container_id,
            command = %command_line,
            "Launching docker executor in container"
        );

        let container_info = nested_container_info(&self.flags, &context.directory);
        let command = CommandInfo {
            value: Some(command_line),
            shell: true,
            ..Default::default()
        };

        self.docker
            .run(
                &container_info,
                &command,
                &context.executor_container_name,
                &context.directory,
                &self.flags.docker_sandbox_directory,
                None,
                &context.environment,
            )
            .await?;

        spawn_wait_process(&self.flags.docker, &context.executor_container_name)
    }
}

#[async_trait::async_trait]
impl ExecutorLauncher for SubprocessLauncher {
    async fn launch(&self, context: LaunchContext) -> Result<LaunchedExecutor> {
        if self.flags.docker_mesos_image.is_some() {
            self.launch_in_container(context).await
        } else {
            self.launch_local(context).await
        }
    }

    async fn reattach(&self, executor_container_name: &str) -> Result<LaunchedExecutor> {
        spawn_wait_process(&self.flags.docker, executor_container_name)
    }
}

/// Test launcher: hands out scripted pids and lets the test deliver exits.
#[derive(Default)]
pub struct MockLauncher {
    state: Mutex<MockLauncherState>,
}

#[derive(Default)]
struct MockLauncherState {
    next_pid: i32,
    launched: Vec<String>,
    reattached: Vec<String>,
    fail_launch: Option<String>,
    exits: HashMap<i32, tokio::sync::oneshot::Sender<Option<i32>>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        let launcher = Self::default();
        launcher.state.lock().unwrap().next_pid = 4711;
        launcher
    }

    /// Container names of every `launch` call.
    pub fn launched(&self) -> Vec<String> {
        self.state.lock().unwrap().launched.clone()
    }

    /// Executor-container names of every `reattach` call.
    pub fn reattached(&self) -> Vec<String> {
        self.state.lock().unwrap().reattached.clone()
    }

    pub fn fail_next_launch(&self, reason: &str) {
        self.state.lock().unwrap().fail_launch = Some(reason.to_string());
    }

    /// Report the helper with this pid as exited.
    pub fn complete(&self, pid: i32, status: Option<i32>) {
        let sender = self.state.lock().unwrap().exits.remove(&pid);
        if let Some(sender) = sender {
            let _ = sender.send(status);
        }
    }

    fn next(&self, record: impl FnOnce(&mut MockLauncherState, i32)) -> Result<LaunchedExecutor> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.fail_launch.take() {
            return Err(AgentError::Internal(reason));
        }

        let pid = state.next_pid;
        state.next_pid += 1;
        record(&mut state, pid);

        let (tx, rx) = tokio::sync::oneshot::channel();
        state.exits.insert(pid, tx);

        Ok(LaunchedExecutor {
            pid,
            status: rx,
            stdin: None,
        })
    }
}

#[async_trait::async_trait]
impl ExecutorLauncher for MockLauncher {
    async fn launch(&self, context: LaunchContext) -> Result<LaunchedExecutor> {
        self.next(|state, _| state.launched.push(context.container_name.clone()))
    }

    async fn reattach(&self, executor_container_name: &str) -> Result<LaunchedExecutor> {
        self.next(|state, _| state.reattached.push(executor_container_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::MockDocker;
    use rmesos_spec::{ExecutorId, FrameworkId};

    fn executor_info() -> ExecutorInfo {
        ExecutorInfo {
            executor_id: ExecutorId::new("executor-1"),
            framework_id: FrameworkId::new("framework-1"),
            command: CommandInfo {
                environment: [("FRAMEWORK_VAR".to_string(), "framework".to_string())].into(),
                ..Default::default()
            },
            container: None,
            resources: Default::default(),
        }
    }

    #[test]
    fn executor_environment_carries_agent_identity() {
        let flags = Flags::default();
        let environment = executor_environment(
            &flags,
            &executor_info(),
            Path::new("/var/sandbox"),
            &SlaveId::new("s1"),
            "slave(1)@127.0.0.1:5051",
            true,
        );

        assert_eq!(environment["MESOS_FRAMEWORK_ID"], "framework-1");
        assert_eq!(environment["MESOS_EXECUTOR_ID"], "executor-1");
        assert_eq!(environment["MESOS_DIRECTORY"], "/var/sandbox");
        assert_eq!(environment["MESOS_SLAVE_ID"], "s1");
        assert_eq!(environment["MESOS_SLAVE_PID"], "slave(1)@127.0.0.1:5051");
        assert_eq!(environment["MESOS_CHECKPOINT"], "1");
        assert_eq!(environment["MESOS_RECOVERY_TIMEOUT"], "15m");
        assert_eq!(environment["FRAMEWORK_VAR"], "framework");
    }

    #[test]
    fn executor_environment_without_checkpointing() {
        let flags = Flags::default();
        let environment = executor_environment(
            &flags,
            &executor_info(),
            Path::new("/var/sandbox"),
            &SlaveId::new("s1"),
            "slave(1)@127.0.0.1:5051",
            false,
        );

        assert_eq!(environment["MESOS_CHECKPOINT"], "0");
        assert!(!environment.contains_key("MESOS_RECOVERY_TIMEOUT"));
    }

    #[test]
    fn nested_container_mounts_socket_and_sandbox() {
        let flags = Flags {
            docker_mesos_image: Some("rmesos/agent:0.3".to_string()),
            ..Flags::default()
        };

        let info = nested_container_info(&flags, Path::new("/var/sandbox"));

        assert_eq!(info.docker.unwrap().image, "rmesos/agent:0.3");
        assert_eq!(info.volumes.len(), 2);
        assert_eq!(
            info.volumes[0].host_path.as_deref(),
            Some("/var/run/docker.sock")
        );
        assert_eq!(info.volumes[0].mode, VolumeMode::Ro);
        assert_eq!(info.volumes[1].host_path.as_deref(), Some("/var/sandbox"));
        assert_eq!(info.volumes[1].mode, VolumeMode::Rw);
    }

    async fn local_launcher_with_fake_helper(exit_code: i32) -> (SubprocessLauncher, LaunchContext, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let launcher_dir = tmp.path().join("libexec");
        let sandbox = tmp.path().join("sandbox");
        tokio::fs::create_dir_all(&launcher_dir).await.unwrap();
        tokio::fs::create_dir_all(&sandbox).await.unwrap();

        let helper = launcher_dir.join(EXECUTOR_BINARY);
        tokio::fs::write(&helper, format!("#!/bin/sh\necho started\nexit {exit_code}\n"))
            .await
            .unwrap();
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755))
            .await
            .unwrap();

        let flags = Arc::new(Flags {
            launcher_dir,
            work_dir: tmp.path().join("work"),
            ..Flags::default()
        });
        let docker: Arc<dyn DockerClient> = Arc::new(MockDocker::new());
        let launcher = SubprocessLauncher::new(flags, docker);

        let context = LaunchContext {
            container_id: ContainerId::new("c1"),
            container_name: "mesos-s1.c1".to_string(),
            executor_container_name: "mesos-s1.c1.executor".to_string(),
            directory: sandbox,
            environment: HashMap::new(),
        };

        (launcher, context, tmp)
    }

    #[tokio::test]
    async fn local_launch_waits_for_handshake() {
        let (launcher, context, _tmp) = local_launcher_with_fake_helper(3).await;
        let sandbox = context.directory.clone();

        let mut launched = launcher.launch(context).await.unwrap();
        assert!(launched.pid > 0);

        // Until the handshake the helper must not have run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let output = tokio::fs::read_to_string(sandbox.join("stdout")).await.unwrap();
        assert!(output.is_empty());

        launched.confirm().await.unwrap();
        assert_eq!(launched.status.await.unwrap(), Some(3));

        let output = tokio::fs::read_to_string(sandbox.join("stdout")).await.unwrap();
        assert_eq!(output, "started\n");
    }

    #[tokio::test]
    async fn abandoned_launch_never_runs_the_helper() {
        let (launcher, context, _tmp) = local_launcher_with_fake_helper(0).await;
        let sandbox = context.directory.clone();

        let mut launched = launcher.launch(context).await.unwrap();
        launched.abandon();

        assert_eq!(launched.status.await.unwrap(), Some(64));
        let output = tokio::fs::read_to_string(sandbox.join("stdout")).await.unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn mock_launcher_scripts_exits() {
        let launcher = MockLauncher::new();
        let context = LaunchContext {
            container_id: ContainerId::new("c1"),
            container_name: "mesos-s1.c1".to_string(),
            executor_container_name: "mesos-s1.c1.executor".to_string(),
            directory: PathBuf::from("/sandbox"),
            environment: HashMap::new(),
        };

        let launched = launcher.launch(context).await.unwrap();
        assert_eq!(launched.pid, 4711);
        assert_eq!(launcher.launched(), vec!["mesos-s1.c1".to_string()]);

        launcher.complete(4711, Some(137));
        assert_eq!(launched.status.await.unwrap(), Some(137));
    }
}
