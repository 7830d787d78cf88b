//! Docker containerizer
//!
//! Owns the registry of running containers and drives each one through
//! FETCHING → PULLING → RUNNING → DESTROYING. The launch pipeline is a chain
//! of awaits; a destroy may land between any two of them, so every stage
//! re-checks registry membership before it touches the container. Teardown
//! fulfils the container's termination promise exactly once and only then
//! drops the registry entry.

use crate::cgroups;
use crate::config::Flags;
use crate::docker::{CliDocker, DockerClient, DockerContainer};
use crate::error::{AgentError, Result};
use crate::fetcher::{ArtifactFetcher, UriFetcher};
use crate::launcher::{
    executor_environment, ExecutorLauncher, LaunchContext, SubprocessLauncher,
};
use crate::names;
use crate::reaper::{OsReaper, Reaper, StatusRx};
use crate::sandbox;
use crate::state::{self, SlaveState};
use crate::usage::{ProcUsage, UsageProbe};
use rmesos_spec::{
    CommandInfo, ContainerId, ContainerInfo, ContainerType, ExecutorInfo, ResourceStatistics,
    Resources, SlaveId, TaskInfo, Termination,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Result carried by the termination promise: a failed `docker stop` during
/// teardown fails the promise instead of fulfilling it.
type TerminationResult = std::result::Result<Termination, String>;

/// Single-assignment promise observable by any number of waiters.
struct Promise<T: Clone> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T: Clone> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> Promise<T> {
    fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(None).0),
        }
    }

    /// First assignment wins; later ones are dropped.
    fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(value);
                true
            } else {
                false
            }
        })
    }

    async fn wait(&self) -> Option<T> {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.as_ref().cloned(),
            Err(_) => None,
        };
        result
    }
}

/// Container lifecycle states. Forward-only, except that FETCHING and
/// PULLING drop straight out of the registry when a destroy wins the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fetching,
    Pulling,
    Running,
    Destroying,
}

/// One registered container. Mutated only under the registry lock.
struct Container {
    id: ContainerId,
    state: State,
    task: Option<TaskInfo>,
    executor: ExecutorInfo,
    directory: PathBuf,
    #[allow(dead_code)]
    symlinked: bool,
    user: Option<String>,
    slave_id: SlaveId,
    slave_pid: String,
    checkpoint: bool,
    resources: Resources,
    /// Init pid inside the Docker container, cached for update/usage.
    pid: Option<i32>,
    /// Pid of the local helper (or the `docker wait` stand-in).
    executor_pid: Option<i32>,
    /// Whether `docker run` has been issued; gates status assignment.
    run_issued: bool,
    /// Aborts an in-flight image pull.
    pull: Option<tokio::task::AbortHandle>,
    /// Failure of the `docker run`, observable by a racing destroy.
    run_error: Arc<OnceLock<String>>,
    /// Exit status delivered by the reaper. Set at most once.
    status: Promise<Option<i32>>,
    /// Fulfilled exactly once, at destruction.
    termination: Promise<TerminationResult>,
}

impl Container {
    fn new(
        id: ContainerId,
        task: Option<TaskInfo>,
        executor: ExecutorInfo,
        sandbox: sandbox::Sandbox,
        user: Option<&str>,
        slave_id: SlaveId,
        slave_pid: &str,
        checkpoint: bool,
    ) -> Self {
        let resources = task
            .as_ref()
            .map(|task| task.resources.clone())
            .unwrap_or_else(|| executor.resources.clone());

        Self {
            id,
            state: State::Fetching,
            task,
            executor,
            directory: sandbox.directory,
            symlinked: sandbox.symlinked,
            user: user.map(String::from),
            slave_id,
            slave_pid: slave_pid.to_string(),
            checkpoint,
            resources,
            pid: None,
            executor_pid: None,
            run_issued: false,
            pull: None,
            run_error: Arc::new(OnceLock::new()),
            status: Promise::new(),
            termination: Promise::new(),
        }
    }

    /// A container re-adopted across an agent restart. Its sandbox and
    /// resources are unknown; it exists to be watched and torn down.
    fn recovered(id: ContainerId, slave_id: SlaveId, executor: ExecutorInfo) -> Self {
        Self {
            id,
            state: State::Running,
            task: None,
            executor,
            directory: PathBuf::new(),
            symlinked: false,
            user: None,
            slave_id,
            slave_pid: String::new(),
            checkpoint: false,
            resources: Resources::default(),
            pid: None,
            executor_pid: None,
            run_issued: true,
            pull: None,
            run_error: Arc::new(OnceLock::new()),
            status: Promise::new(),
            termination: Promise::new(),
        }
    }

    fn name(&self) -> String {
        names::container_name(&self.slave_id, &self.id)
    }

    fn executor_name(&self) -> String {
        names::executor_container_name(&self.slave_id, &self.id)
    }

    fn container_info(&self) -> Option<&ContainerInfo> {
        match &self.task {
            Some(task) => task.container.as_ref(),
            None => self.executor.container.as_ref(),
        }
    }

    /// The command the Docker container runs: the task's when one is
    /// wrapped, the executor's otherwise.
    fn command(&self) -> CommandInfo {
        match &self.task {
            Some(task) => task.command.clone().unwrap_or_default(),
            None => self.executor.command.clone(),
        }
    }

    /// Environment for the Docker container itself. A wrapped task brings
    /// its own; a custom executor needs the agent identity to phone home.
    fn run_environment(&self, flags: &Flags) -> HashMap<String, String> {
        match &self.task {
            Some(task) => task
                .command
                .as_ref()
                .map(|command| command.environment.clone())
                .unwrap_or_default(),
            None => executor_environment(
                flags,
                &self.executor,
                &self.directory,
                &self.slave_id,
                &self.slave_pid,
                self.checkpoint,
            ),
        }
    }
}

fn destroyed(container: &ContainerId, phase: &'static str) -> AgentError {
    AgentError::DestroyedInFlight {
        container: container.clone(),
        phase,
    }
}

/// The containerizer. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct DockerContainerizer {
    flags: Arc<Flags>,
    docker: Arc<dyn DockerClient>,
    fetcher: Arc<dyn ArtifactFetcher>,
    launcher: Arc<dyn ExecutorLauncher>,
    reaper: Arc<dyn Reaper>,
    probe: Arc<dyn UsageProbe>,
    containers: Arc<Mutex<HashMap<ContainerId, Container>>>,
}

impl DockerContainerizer {
    /// Containerizer with production collaborators: the Docker CLI, the
    /// local URI fetcher, subprocess launching, and `/proc` sampling.
    pub fn create(flags: Flags) -> Self {
        let flags = Arc::new(flags);
        let docker: Arc<dyn DockerClient> = Arc::new(CliDocker::new(flags.docker.clone()));
        let launcher = Arc::new(SubprocessLauncher::new(flags.clone(), docker.clone()));

        Self {
            flags,
            docker,
            fetcher: Arc::new(UriFetcher::new()),
            launcher,
            reaper: Arc::new(OsReaper::new()),
            probe: Arc::new(ProcUsage::new()),
            containers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Containerizer over explicit collaborators; tests inject doubles here.
    pub fn new(
        flags: Flags,
        docker: Arc<dyn DockerClient>,
        fetcher: Arc<dyn ArtifactFetcher>,
        launcher: Arc<dyn ExecutorLauncher>,
        reaper: Arc<dyn Reaper>,
        probe: Arc<dyn UsageProbe>,
    ) -> Self {
        Self {
            flags: Arc::new(flags),
            docker,
            fetcher,
            launcher,
            reaper,
            probe,
            containers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn with_container<R>(
        &self,
        container_id: &ContainerId,
        f: impl FnOnce(&mut Container) -> R,
    ) -> Option<R> {
        let mut containers = self.containers.lock().await;
        containers.get_mut(container_id).map(f)
    }

    /// Launch an executor (optionally wrapping a single task) inside a
    /// Docker container.
    ///
    /// Returns `Ok(false)` without registering anything when the request
    /// does not describe a Docker container; the agent falls through to its
    /// next containerizer. Resolves `true` once the executor is running and
    /// its reaper is armed.
    #[allow(clippy::too_many_arguments)]
    pub async fn launch(
        &self,
        container_id: &ContainerId,
        task: Option<TaskInfo>,
        executor: ExecutorInfo,
        directory: &Path,
        user: Option<&str>,
        slave_id: &SlaveId,
        slave_pid: &str,
        checkpoint: bool,
    ) -> Result<bool> {
        if self.containers.lock().await.contains_key(container_id) {
            return Err(AgentError::AlreadyStarted {
                container: container_id.clone(),
            });
        }

        let container_info = match &task {
            Some(task) => task.container.as_ref(),
            None => executor.container.as_ref(),
        };
        let Some(container_info) = container_info else {
            info!(container = %container_id, "No container info found, skipping launch");
            return Ok(false);
        };
        if container_info.type_ != ContainerType::Docker {
            info!(container = %container_id, "Skipping non-docker container");
            return Ok(false);
        }

        let sandbox =
            sandbox::prepare(&self.flags, slave_id, container_id, directory, user).await?;

        info!(
            container = %container_id,
            executor = %executor.executor_id,
            framework = %executor.framework_id,
            task = ?task.as_ref().map(|task| task.task_id.to_string()),
            "Starting container"
        );

        let container = Container::new(
            container_id.clone(),
            task,
            executor,
            sandbox,
            user,
            slave_id.clone(),
            slave_pid,
            checkpoint,
        );

        {
            let mut containers = self.containers.lock().await;
            if containers.contains_key(container_id) {
                return Err(AgentError::AlreadyStarted {
                    container: container_id.clone(),
                });
            }
            containers.insert(container_id.clone(), container);
        }

        match self.run_launch_pipeline(container_id).await {
            Ok(()) => Ok(true),
            Err(e) => {
                // Nothing will be reaped for a pipeline that died after
                // `docker run`; resolve the status promise so the teardown's
                // wait completes. A failed run keeps its own cleanup path.
                {
                    let mut containers = self.containers.lock().await;
                    if let Some(container) = containers.get_mut(container_id) {
                        if container.run_issued && container.run_error.get().is_none() {
                            container.status.set(None);
                        }
                    }
                }
                self.destroy_with(container_id, true).await;
                Err(e)
            }
        }
    }

    /// The FETCHING → PULLING → RUNNING chain. Every await is a point where
    /// a destroy may have removed the container, hence the re-lookups.
    async fn run_launch_pipeline(&self, container_id: &ContainerId) -> Result<()> {
        // FETCHING: bring the command's artifacts into the sandbox.
        let (command, directory, user) = self
            .with_container(container_id, |container| {
                (
                    container.command(),
                    container.directory.clone(),
                    container.user.clone(),
                )
            })
            .await
            .ok_or_else(|| destroyed(container_id, "launching"))?;

        self.fetcher
            .fetch(container_id, &command, &directory, user.as_deref())
            .await?;

        // PULLING: the pull runs in its own task so a destroy can discard it.
        let (image, force_pull) = self
            .with_container(container_id, |container| {
                container.state = State::Pulling;
                let docker_info = container.container_info().and_then(|info| info.docker.as_ref());
                (
                    docker_info.map(|docker| docker.image.clone()),
                    docker_info.map(|docker| docker.force_pull_image).unwrap_or(false),
                )
            })
            .await
            .ok_or_else(|| destroyed(container_id, "launching"))?;
        let image = image.ok_or_else(|| {
            AgentError::Internal("No docker image found in container info".to_string())
        })?;

        let pull = {
            let docker = self.docker.clone();
            let directory = directory.clone();
            let image = image.clone();
            tokio::spawn(async move { docker.pull(&directory, &image, force_pull).await })
        };

        let registered = self
            .with_container(container_id, |container| {
                container.pull = Some(pull.abort_handle());
            })
            .await
            .is_some();
        if !registered {
            pull.abort();
            return Err(destroyed(container_id, "pulling image"));
        }

        match pull.await {
            Ok(result) => {
                result?;
            }
            // Aborted by a destroy.
            Err(_) => return Err(destroyed(container_id, "pulling image")),
        }
        debug!(image = %image, "Docker pull completed");

        // RUNNING: issue the detached `docker run`.
        let run = self
            .with_container(container_id, |container| {
                container.state = State::Running;
                container.run_issued = true;
                (
                    container.container_info().cloned(),
                    container.command(),
                    container.name(),
                    container.resources.clone(),
                    container.run_environment(&self.flags),
                    container.run_error.clone(),
                    container.task.is_some(),
                )
            })
            .await
            .ok_or_else(|| destroyed(container_id, "pulling image"))?;
        let (container_info, command, name, resources, run_environment, run_error, has_task) = run;
        let container_info = container_info.ok_or_else(|| {
            AgentError::Internal("No container info found in registered container".to_string())
        })?;

        if let Err(e) = self
            .docker
            .run(
                &container_info,
                &command,
                &name,
                &directory,
                &self.flags.docker_sandbox_directory,
                Some(&resources),
                &run_environment,
            )
            .await
        {
            let _ = run_error.set(e.to_string());
            return Err(AgentError::Run {
                container: container_id.clone(),
                reason: e.to_string(),
            });
        }

        let status = if has_task {
            self.launch_executor_helper(container_id, &name, &directory).await?
        } else {
            self.adopt_container_init(container_id, &name).await?
        };

        // Stream container output into the sandbox.
        if let Err(e) = self.docker.logs(&name, &directory).await {
            warn!(container = %container_id, error = %e, "Failed to attach container logs");
        }

        self.arm_reaper(container_id, status);
        Ok(())
    }

    /// Start `mesos-docker-executor` for a wrapped task and walk it through
    /// the checkpoint handshake.
    async fn launch_executor_helper(
        &self,
        container_id: &ContainerId,
        name: &str,
        directory: &Path,
    ) -> Result<StatusRx> {
        let (environment, executor_container_name) = self
            .with_container(container_id, |container| {
                (
                    executor_environment(
                        &self.flags,
                        &container.executor,
                        &container.directory,
                        &container.slave_id,
                        &container.slave_pid,
                        container.checkpoint,
                    ),
                    container.executor_name(),
                )
            })
            .await
            .ok_or_else(|| destroyed(container_id, "launching"))?;

        let context = LaunchContext {
            container_id: container_id.clone(),
            container_name: name.to_string(),
            executor_container_name,
            directory: directory.to_path_buf(),
            environment,
        };

        let mut launched = self.launcher.launch(context).await?;

        let _ = self
            .with_container(container_id, |container| {
                container.executor_pid = Some(launched.pid);
            })
            .await;

        if let Err(e) = self.checkpoint_pid(container_id, launched.pid).await {
            // Closing the pipe makes the helper abort instead of starting.
            launched.abandon();
            return Err(e);
        }

        if let Err(e) = launched.confirm().await {
            let reason = format!("Failed to synchronize with child process: {e}");
            // Observable by the destroy that follows, which then takes the
            // failed-run cleanup path.
            let _ = self
                .with_container(container_id, |container| {
                    let _ = container.run_error.set(reason.clone());
                })
                .await;
            return Err(AgentError::Launch {
                container: container_id.clone(),
                reason,
            });
        }

        Ok(launched.status)
    }

    /// Custom executors run inside the container itself: inspect it for the
    /// init pid, checkpoint that, and watch it directly.
    async fn adopt_container_init(
        &self,
        container_id: &ContainerId,
        name: &str,
    ) -> Result<StatusRx> {
        let inspected = self.docker.inspect(name).await?;
        let pid = inspected.pid.ok_or_else(|| {
            AgentError::Internal("Unable to get executor pid after launch".to_string())
        })?;

        self.checkpoint_pid(container_id, pid).await?;

        self.with_container(container_id, |container| {
            container.executor_pid = Some(pid);
            container.pid = Some(pid);
        })
        .await
        .ok_or_else(|| destroyed(container_id, "launching"))?;

        Ok(self.reaper.watch(pid))
    }

    /// Persist the forked pid when the executor asked for checkpointing.
    async fn checkpoint_pid(&self, container_id: &ContainerId, pid: i32) -> Result<()> {
        let checkpoint = self
            .with_container(container_id, |container| {
                container.checkpoint.then(|| {
                    (
                        container.slave_id.clone(),
                        container.executor.framework_id.clone(),
                        container.executor.executor_id.clone(),
                    )
                })
            })
            .await
            .ok_or_else(|| destroyed(container_id, "launching"))?;

        if let Some((slave_id, framework_id, executor_id)) = checkpoint {
            let path = state::forked_pid_path(
                &state::meta_root(&self.flags.work_dir),
                &slave_id,
                &framework_id,
                &executor_id,
                container_id,
            );
            info!(pid, path = %path.display(), "Checkpointing executor pid");
            state::checkpoint(&path, &pid.to_string()).await?;
        }

        Ok(())
    }

    /// Wire the reaper's verdict into the state machine: record the exit
    /// status and drive the normal teardown.
    fn arm_reaper(&self, container_id: &ContainerId, status: StatusRx) {
        let this = self.clone();
        let container_id = container_id.clone();
        tokio::spawn(async move {
            let exit = status.await.unwrap_or(None);

            let known = {
                let containers = this.containers.lock().await;
                match containers.get(&container_id) {
                    Some(container) => {
                        container.status.set(exit);
                        true
                    }
                    None => false,
                }
            };

            if known {
                info!(container = %container_id, "Executor for container has exited");
                this.destroy_with(&container_id, false).await;
            }
        });
    }

    /// Update the container's resource allocation (cgroup writes).
    ///
    /// Deliberately a no-op for unknown or dying containers, identical
    /// resources, and agents nested in Docker (host cgroups are not ours to
    /// touch there).
    pub async fn update(&self, container_id: &ContainerId, resources: &Resources) -> Result<()> {
        {
            let mut containers = self.containers.lock().await;
            let Some(container) = containers.get_mut(container_id) else {
                warn!(container = %container_id, "Ignoring update of unknown container");
                return Ok(());
            };

            if container.state == State::Destroying {
                info!(container = %container_id, "Ignoring update of container being destroyed");
                return Ok(());
            }

            if &container.resources == resources {
                info!(
                    container = %container_id,
                    "Ignoring update with resources identical to the existing ones"
                );
                return Ok(());
            }

            // Stored regardless of what happens below; usage() reports them.
            container.resources = resources.clone();
        }

        if self.flags.docker_mesos_image.is_some() {
            info!("Ignoring update as agent is running inside a Docker container");
            return Ok(());
        }

        if resources.is_empty() {
            warn!(container = %container_id, "Ignoring update as no supported resources are present");
            return Ok(());
        }

        let Some(pid) = self.container_pid(container_id).await? else {
            return Ok(());
        };

        cgroups::update_limits(container_id, pid, resources.cpus, resources.mem_bytes).await
    }

    /// The container's init pid, from cache or `docker inspect`.
    async fn container_pid(&self, container_id: &ContainerId) -> Result<Option<i32>> {
        let Some((cached, name)) = self
            .with_container(container_id, |container| {
                (container.pid, container.name())
            })
            .await
        else {
            return Ok(None);
        };

        if cached.is_some() {
            return Ok(cached);
        }

        let inspected: DockerContainer = self.docker.inspect(&name).await?;

        let cached = self
            .with_container(container_id, |container| {
                container.pid = inspected.pid;
            })
            .await;
        if cached.is_none() {
            info!(
                container = %container_id,
                "Container was removed during docker inspect, skipping"
            );
            return Ok(None);
        }

        Ok(inspected.pid)
    }

    /// Sample the container's resource usage, with the declared limits
    /// overlaid.
    pub async fn usage(&self, container_id: &ContainerId) -> Result<ResourceStatistics> {
        {
            let containers = self.containers.lock().await;
            let Some(container) = containers.get(container_id) else {
                return Err(AgentError::UnknownContainer {
                    container: container_id.clone(),
                });
            };
            if container.state == State::Destroying {
                return Err(AgentError::BeingRemoved {
                    container: container_id.clone(),
                });
            }
        }

        if self.flags.docker_mesos_image.is_some() {
            // The containers run on the host daemon while this agent sits in
            // its own container, so their cgroups are invisible from here.
            return Ok(ResourceStatistics::default());
        }

        let pid = self.container_pid(container_id).await?;
        let Some(pid) = pid else {
            return Err(AgentError::Usage {
                reason: "Container is not running".to_string(),
            });
        };

        let mut statistics = self.probe.usage(pid).await?;

        let resources = self
            .with_container(container_id, |container| {
                (container.state, container.resources.clone())
            })
            .await;
        let Some((state, resources)) = resources else {
            return Err(AgentError::UnknownContainer {
                container: container_id.clone(),
            });
        };
        if state == State::Destroying {
            return Err(AgentError::BeingRemoved {
                container: container_id.clone(),
            });
        }

        if let Some(mem_bytes) = resources.mem_bytes {
            statistics.mem_limit_bytes = Some(mem_bytes);
        }
        if let Some(cpus) = resources.cpus {
            statistics.cpus_limit = Some(cpus);
        }

        Ok(statistics)
    }

    /// The container's termination promise. Pending until a destroy (or the
    /// executor's own exit) completes teardown.
    pub async fn wait(&self, container_id: &ContainerId) -> Result<Termination> {
        let termination = self
            .with_container(container_id, |container| container.termination.clone())
            .await
            .ok_or_else(|| AgentError::UnknownContainer {
                container: container_id.clone(),
            })?;

        match termination.wait().await {
            Some(Ok(termination)) => Ok(termination),
            Some(Err(message)) => Err(AgentError::Internal(message)),
            None => Err(AgentError::Internal(
                "termination promise was dropped".to_string(),
            )),
        }
    }

    /// Destroy a container. Idempotent: destroys after the first are no-ops.
    pub async fn destroy(&self, container_id: &ContainerId) {
        self.destroy_with(container_id, true).await;
    }

    async fn destroy_with(&self, container_id: &ContainerId, killed: bool) {
        let mut containers = self.containers.lock().await;
        let Some(container) = containers.get_mut(container_id) else {
            warn!(container = %container_id, "Ignoring destroy of unknown container");
            return;
        };

        // A failed `docker run` leaves nothing to stop; clean up in place.
        if let Some(reason) = container.run_error.get() {
            debug!(container = %container_id, "Container run failed");
            container.termination.set(Ok(Termination {
                killed,
                status: None,
                message: format!("Failed to run container: {reason}"),
            }));
            containers.remove(container_id);
            return;
        }

        match container.state {
            State::Destroying => {}

            State::Fetching => {
                info!(container = %container_id, "Destroying container in FETCHING state");
                container.termination.set(Ok(Termination {
                    killed,
                    status: None,
                    message: "Container destroyed while fetching".to_string(),
                }));
                // Removing the entry here means a fetch that races the kill
                // to success still cannot proceed to `docker run`.
                containers.remove(container_id);
                drop(containers);
                self.fetcher.kill(container_id).await;
            }

            State::Pulling => {
                info!(container = %container_id, "Destroying container in PULLING state");
                if let Some(pull) = container.pull.take() {
                    pull.abort();
                }
                container.termination.set(Ok(Termination {
                    killed,
                    status: None,
                    message: "Container destroyed while pulling image".to_string(),
                }));
                containers.remove(container_id);
            }

            State::Running => {
                info!(container = %container_id, "Destroying container");
                container.state = State::Destroying;

                let name = container.name();
                let executor_name = container.executor_name();
                let executor_pid = container.executor_pid;
                let status = container.status.clone();
                drop(containers);

                // Stop the executor container unconditionally: this run may
                // have been recovered from an agent that launched nested.
                {
                    let docker = self.docker.clone();
                    let executor_name = executor_name.clone();
                    tokio::spawn(async move {
                        if let Err(e) = docker.stop(&executor_name, Duration::ZERO, false).await {
                            debug!(
                                container = %executor_name,
                                error = %e,
                                "Ignoring error stopping executor container"
                            );
                        }
                    });
                }

                // The executor may never have seen its task if an update
                // failed mid-launch; killing it directly also unblocks the
                // status wait below.
                if let Some(pid) = executor_pid {
                    info!(pid, "Sending SIGTERM to executor");
                    if let Err(e) = self.reaper.kill_tree(pid, libc::SIGTERM) {
                        debug!(
                            pid,
                            error = %e,
                            "Ignoring error killing executor process tree"
                        );
                    }
                }

                let this = self.clone();
                let container_id = container_id.clone();
                tokio::spawn(async move {
                    let exit = status.wait().await.flatten();
                    this.finish_destroy(&container_id, killed, exit, name, executor_name)
                        .await;
                });
            }
        }
    }

    /// Runs once the executor's status has settled: stop the container,
    /// fulfil the termination, drop the registry entry, schedule removal.
    async fn finish_destroy(
        &self,
        container_id: &ContainerId,
        killed: bool,
        exit: Option<i32>,
        name: String,
        executor_name: String,
    ) {
        info!(container = %container_id, "Running docker stop on container");

        let stopped = self
            .docker
            .stop(&name, self.flags.docker_stop_timeout, false)
            .await;

        let termination = match stopped {
            Ok(()) => Ok(Termination {
                killed,
                status: exit,
                message: if killed {
                    "Container killed".to_string()
                } else {
                    "Container terminated".to_string()
                },
            }),
            // TODO(agent): the container may well still be running here;
            // retry the stop or sweep leftovers with a periodic GC.
            Err(e) => Err(format!("Failed to kill the Docker container: {e}")),
        };

        {
            let mut containers = self.containers.lock().await;
            let Some(container) = containers.get(container_id) else {
                // A racing run-failure cleanup beat us to it.
                return;
            };
            container.termination.set(termination);
            containers.remove(container_id);
        }

        self.schedule_remove(name, executor_name);
    }

    /// `docker rm -f` both container names after the configured delay.
    fn schedule_remove(&self, name: String, executor_name: String) {
        let docker = self.docker.clone();
        let delay = self.flags.docker_remove_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = docker.rm(&name, true).await {
                debug!(container = %name, error = %e, "Delayed container removal failed");
            }
            if let Err(e) = docker.rm(&executor_name, true).await {
                debug!(container = %executor_name, error = %e, "Delayed container removal failed");
            }
        });
    }

    /// Snapshot of the registered container ids.
    pub async fn containers(&self) -> HashSet<ContainerId> {
        self.containers.lock().await.keys().cloned().collect()
    }

    /// Reconcile persisted executor runs with the live Docker state after an
    /// agent restart.
    pub async fn recover(&self, state: Option<SlaveState>) -> Result<()> {
        info!("Recovering Docker containers");

        let Some(state) = state else {
            return Ok(());
        };

        let prefix = format!("{}{}", names::DOCKER_NAME_PREFIX, state.id);
        let live = self.docker.ps(true, Some(&prefix)).await?;

        let mut task_containers: HashMap<ContainerId, DockerContainer> = HashMap::new();
        let mut executor_containers: HashMap<ContainerId, DockerContainer> = HashMap::new();
        for container in live {
            // Ignore containers we did not start.
            let Some(id) = names::parse(&container.name) else {
                continue;
            };

            if names::is_executor_container(&container.name) {
                debug!(container = %id, "Detected executor container");
                executor_containers.insert(id, container);
            } else {
                debug!(container = %id, "Detected docker container");
                task_containers.insert(id, container);
            }
        }

        // Claimed executor pids, to catch the (pathological) case of two
        // recovered runs pointing at one pid.
        let mut claimed: HashSet<i32> = HashSet::new();

        for framework in state.frameworks.values() {
            for executor in framework.executors.values() {
                let Some(info) = &executor.info else {
                    warn!(
                        executor = %executor.id,
                        framework = %framework.id,
                        "Skipping recovery of executor because its info could not be recovered"
                    );
                    continue;
                };

                let Some(latest) = &executor.latest else {
                    warn!(
                        executor = %executor.id,
                        framework = %framework.id,
                        "Skipping recovery of executor because its latest run could not be recovered"
                    );
                    continue;
                };

                let Some(run) = executor.runs.get(latest) else {
                    warn!(
                        executor = %executor.id,
                        framework = %framework.id,
                        "Skipping recovery of executor because its latest run state is missing"
                    );
                    continue;
                };

                // Without a pid there is nothing to reap; the agent's wait
                // on this container fails and cleans everything up.
                let Some(executor_pid) = run.forked_pid else {
                    continue;
                };

                if run.completed {
                    debug!(
                        executor = %executor.id,
                        container = %latest,
                        "Skipping recovery of executor because its latest run is completed"
                    );
                    continue;
                }

                info!(
                    container = %latest,
                    executor = %executor.id,
                    framework = %framework.id,
                    "Recovering container"
                );

                self.recover_container(
                    latest,
                    &state.id,
                    info,
                    executor_pid,
                    &mut task_containers,
                    &mut executor_containers,
                    &mut claimed,
                )
                .await?;
            }
        }

        if self.flags.docker_kill_orphans {
            for container in task_containers.values().chain(executor_containers.values()) {
                info!(container = %container.name, "Stopping orphaned container");
                if let Err(e) = self
                    .docker
                    .stop(&container.name, self.flags.docker_stop_timeout, true)
                    .await
                {
                    warn!(
                        container = %container.name,
                        error = %e,
                        "Failed to stop orphaned container"
                    );
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn recover_container(
        &self,
        container_id: &ContainerId,
        slave_id: &SlaveId,
        info: &ExecutorInfo,
        executor_pid: i32,
        task_containers: &mut HashMap<ContainerId, DockerContainer>,
        executor_containers: &mut HashMap<ContainerId, DockerContainer>,
        claimed: &mut HashSet<i32>,
    ) -> Result<()> {
        let mut reattach = false;
        if !self.reaper.exists(executor_pid) && task_containers.contains_key(container_id) {
            // The forked helper died with a previous (containerized) agent.
            // The one recoverable shape is a container that is still running
            // plus a live executor container to wait on.
            let live = &task_containers[container_id];
            if live.pid.is_none() {
                info!(
                    container = %container_id,
                    "Skipping recovery of container as it already completed"
                );
                return Ok(());
            }

            if !executor_containers.contains_key(container_id) {
                // Executors are not assumed relaunchable, so a missing one
                // ends this run here.
                info!(
                    container = %container_id,
                    "Skipping recovery of container as its executor cannot be found"
                );
                return Ok(());
            }

            reattach = true;
        }

        if !claimed.insert(executor_pid) {
            return Err(AgentError::Recovery {
                reason: format!(
                    "Detected duplicate pid {executor_pid} for container {container_id}"
                ),
            });
        }

        task_containers.remove(container_id);

        let container = Container::recovered(container_id.clone(), slave_id.clone(), info.clone());
        self.containers
            .lock()
            .await
            .insert(container_id.clone(), container);

        let status = if reattach {
            debug!(container = %container_id, "Rewaiting on executor container");
            let Some(executor_container) = executor_containers.remove(container_id) else {
                return Ok(());
            };
            self.launcher.reattach(&executor_container.name).await?.status
        } else {
            debug!(container = %container_id, pid = executor_pid, "Rewaiting on executor pid");
            self.reaper.watch(executor_pid)
        };

        self.arm_reaper(container_id, status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmesos_spec::{ExecutorId, FrameworkId, TaskId};

    fn executor_info() -> ExecutorInfo {
        ExecutorInfo {
            executor_id: ExecutorId::new("executor-1"),
            framework_id: FrameworkId::new("framework-1"),
            command: CommandInfo {
                value: Some("./executor".to_string()),
                environment: [("EXECUTOR_VAR".to_string(), "executor".to_string())].into(),
                ..Default::default()
            },
            container: Some(ContainerInfo::docker("busybox")),
            resources: Resources::default(),
        }
    }

    fn task_info() -> TaskInfo {
        TaskInfo {
            name: "sleep".to_string(),
            task_id: TaskId::new("task-1"),
            slave_id: SlaveId::new("s1"),
            command: Some(CommandInfo {
                value: Some("sleep 100".to_string()),
                environment: [("TASK_VAR".to_string(), "task".to_string())].into(),
                ..Default::default()
            }),
            container: Some(ContainerInfo::docker("busybox")),
            resources: Resources::new(Some(0.5), Some(64 << 20)),
        }
    }

    fn container(task: Option<TaskInfo>) -> Container {
        Container::new(
            ContainerId::new("c1"),
            task,
            executor_info(),
            sandbox::Sandbox {
                directory: PathBuf::from("/var/sandbox"),
                symlinked: false,
            },
            None,
            SlaveId::new("s1"),
            "slave(1)@127.0.0.1:5051",
            false,
        )
    }

    #[tokio::test]
    async fn promise_first_assignment_wins() {
        let promise: Promise<i32> = Promise::new();
        assert!(promise.set(1));
        assert!(!promise.set(2));
        assert_eq!(promise.wait().await, Some(1));
    }

    #[tokio::test]
    async fn promise_is_observable_by_many_waiters() {
        let promise: Promise<&'static str> = Promise::new();

        let early = {
            let promise = promise.clone();
            tokio::spawn(async move { promise.wait().await })
        };

        promise.set("done");
        assert_eq!(early.await.unwrap(), Some("done"));
        // A waiter subscribing after the fact sees the same value.
        assert_eq!(promise.wait().await, Some("done"));
    }

    #[test]
    fn docker_names_follow_the_scheme() {
        let container = container(None);
        assert_eq!(container.name(), "mesos-s1.c1");
        assert_eq!(container.executor_name(), "mesos-s1.c1.executor");
    }

    #[test]
    fn wrapped_tasks_run_their_own_command() {
        let with_task = container(Some(task_info()));
        assert_eq!(with_task.command().value.as_deref(), Some("sleep 100"));
        assert_eq!(with_task.resources, Resources::new(Some(0.5), Some(64 << 20)));

        let custom = container(None);
        assert_eq!(custom.command().value.as_deref(), Some("./executor"));
    }

    #[test]
    fn run_environment_depends_on_the_launch_shape() {
        let flags = Flags::default();

        // A wrapped task brings exactly its own environment.
        let with_task = container(Some(task_info()));
        let environment = with_task.run_environment(&flags);
        assert_eq!(environment["TASK_VAR"], "task");
        assert!(!environment.contains_key("MESOS_SLAVE_ID"));

        // A custom executor gets the agent identity merged in.
        let custom = container(None);
        let environment = custom.run_environment(&flags);
        assert_eq!(environment["MESOS_SLAVE_ID"], "s1");
        assert_eq!(environment["MESOS_FRAMEWORK_ID"], "framework-1");
        assert_eq!(environment["EXECUTOR_VAR"], "executor");
    }

    #[test]
    fn recovered_containers_start_out_running() {
        let container = Container::recovered(
            ContainerId::new("c9"),
            SlaveId::new("s1"),
            executor_info(),
        );
        assert_eq!(container.state, State::Running);
        assert!(container.run_issued);
        assert!(container.executor_pid.is_none());
    }
}
