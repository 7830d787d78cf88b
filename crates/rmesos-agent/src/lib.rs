//! rmesos agent — Docker containerizer
//!
//! Runs executors (optionally wrapping a single task) inside Docker
//! containers on a worker node: sandbox preparation, artifact fetching,
//! image pull, container launch, executor supervision, resource updates,
//! usage sampling, teardown, and recovery across agent restarts.

pub mod cgroups;
pub mod config;
pub mod containerizer;
pub mod docker;
pub mod error;
pub mod fetcher;
pub mod launcher;
pub mod names;
pub mod reaper;
pub mod sandbox;
pub mod state;
pub mod usage;

pub use config::Flags;
pub use containerizer::DockerContainerizer;
pub use docker::{CliDocker, DockerClient, DockerContainer, DockerImage, MockDocker};
pub use error::{AgentError, Result};
pub use fetcher::{ArtifactFetcher, MockFetcher, UriFetcher};
pub use launcher::{
    ExecutorLauncher, LaunchContext, LaunchedExecutor, MockLauncher, SubprocessLauncher,
};
pub use reaper::{MockReaper, OsReaper, Reaper};
pub use sandbox::Sandbox;
pub use state::{ExecutorState, FrameworkState, RunState, SlaveState};
pub use usage::{MockUsage, ProcUsage, UsageProbe};
