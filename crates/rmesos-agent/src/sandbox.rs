//! Sandbox preparation
//!
//! Before a container is registered its sandbox must exist in a usable state:
//! `stdout`/`stderr` present, owned by the run-as user, and reachable through
//! a path the Docker CLI will accept.

use crate::config::Flags;
use crate::error::{AgentError, Result};
use rmesos_spec::{ContainerId, SlaveId};
use std::path::{Path, PathBuf};
use tracing::info;

/// Directory (relative to the slave's work directory) holding symlinks for
/// sandboxes whose real path the Docker CLI cannot take.
pub const DOCKER_SYMLINK_DIRECTORY: &str = "docker/links";

/// A prepared sandbox: the path to hand to Docker and whether it is a
/// symlink into the links directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub directory: PathBuf,
    pub symlinked: bool,
}

/// The slave's runtime directory under the agent work directory.
pub fn slave_path(work_dir: &Path, slave_id: &SlaveId) -> PathBuf {
    work_dir.join("slaves").join(slave_id.as_str())
}

fn sandbox_error(reason: String) -> AgentError {
    AgentError::Sandbox { reason }
}

/// Create a file if it does not exist yet, leaving existing content alone.
async fn touch(path: &Path) -> Result<()> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| sandbox_error(format!("failed to touch '{}': {e}", path.display())))?;
    Ok(())
}

/// Recursively hand the sandbox to the run-as user.
async fn chown_recursive(user: &str, directory: &Path) -> Result<()> {
    let output = tokio::process::Command::new("chown")
        .arg("-R")
        .arg(user)
        .arg(directory)
        .output()
        .await
        .map_err(|e| sandbox_error(format!("failed to run chown: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(sandbox_error(format!(
            "failed to chown '{}' to '{user}': {}",
            directory.display(),
            stderr.trim()
        )));
    }

    Ok(())
}

/// Prepare the sandbox for a container about to launch.
///
/// The returned path is the one Docker sees. It differs from `directory` only
/// when that path contains a colon: the Docker CLI treats `:` as the volume
/// separator, so such sandboxes are reached through a colon-free symlink
/// under the slave's links directory instead. The symlink is stable for the
/// life of the container.
pub async fn prepare(
    flags: &Flags,
    slave_id: &SlaveId,
    container_id: &ContainerId,
    directory: &Path,
    user: Option<&str>,
) -> Result<Sandbox> {
    touch(&directory.join("stdout")).await?;
    touch(&directory.join("stderr")).await?;

    if let Some(user) = user {
        chown_recursive(user, directory).await?;
    }

    let links = slave_path(&flags.work_dir, slave_id).join(DOCKER_SYMLINK_DIRECTORY);
    tokio::fs::create_dir_all(&links).await.map_err(|e| {
        sandbox_error(format!(
            "unable to create symlink folder '{}': {e}",
            links.display()
        ))
    })?;

    if directory.to_string_lossy().contains(':') {
        let link = links.join(container_id.as_str());
        tokio::fs::symlink(directory, &link).await.map_err(|e| {
            sandbox_error(format!(
                "failed to symlink directory '{}' to '{}': {e}",
                directory.display(),
                link.display()
            ))
        })?;

        info!(
            container = %container_id,
            sandbox = %link.display(),
            "Sandbox path contains a colon, using symlink"
        );

        return Ok(Sandbox {
            directory: link,
            symlinked: true,
        });
    }

    Ok(Sandbox {
        directory: directory.to_path_buf(),
        symlinked: false,
    })
}
