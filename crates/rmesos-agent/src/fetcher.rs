//! Artifact fetching into the sandbox
//!
//! The containerizer only depends on the fetch contract: download a command's
//! URIs into the sandbox before launch, and kill an in-flight fetch when the
//! container is destroyed mid-download.

use crate::error::{AgentError, Result};
use rmesos_spec::{CommandInfo, ContainerId};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Seam for sandbox artifact downloads.
#[async_trait::async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch the command's URIs into `directory`. Resolves once every URI is
    /// in place; fails fast when `kill` is called for the same container.
    async fn fetch(
        &self,
        container_id: &ContainerId,
        command: &CommandInfo,
        directory: &Path,
        user: Option<&str>,
    ) -> Result<()>;

    /// Abort an in-flight fetch for the container, if any.
    async fn kill(&self, container_id: &ContainerId);
}

/// Fetcher for local URIs (`file://` or bare paths): artifacts are copied
/// into the sandbox and optionally marked executable. Remote schemes are the
/// external fetcher's business and are rejected here.
#[derive(Default)]
pub struct UriFetcher {
    killed: Mutex<HashMap<ContainerId, Arc<Notify>>>,
}

impl UriFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn killer(&self, container_id: &ContainerId) -> Arc<Notify> {
        self.killed
            .lock()
            .unwrap()
            .entry(container_id.clone())
            .or_default()
            .clone()
    }

    async fn fetch_one(uri: &str, executable: bool, directory: &Path) -> Result<()> {
        let source = uri.strip_prefix("file://").unwrap_or(uri);
        if source.contains("://") {
            return Err(AgentError::Internal(format!(
                "unsupported URI scheme in '{uri}'"
            )));
        }

        let source = Path::new(source);
        let file_name = source.file_name().ok_or_else(|| {
            AgentError::Internal(format!("URI '{uri}' has no file name"))
        })?;
        let target = directory.join(file_name);

        tokio::fs::copy(source, &target)
            .await
            .map_err(|e| AgentError::Internal(format!("failed to copy '{uri}': {e}")))?;

        if executable {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = tokio::fs::metadata(&target)
                .await
                .map_err(|e| AgentError::Internal(format!("failed to stat '{uri}': {e}")))?
                .permissions();
            permissions.set_mode(permissions.mode() | 0o111);
            tokio::fs::set_permissions(&target, permissions)
                .await
                .map_err(|e| AgentError::Internal(format!("failed to chmod '{uri}': {e}")))?;
        }

        debug!(uri, target = %target.display(), "Fetched artifact");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ArtifactFetcher for UriFetcher {
    async fn fetch(
        &self,
        container_id: &ContainerId,
        command: &CommandInfo,
        directory: &Path,
        _user: Option<&str>,
    ) -> Result<()> {
        let killer = self.killer(container_id);

        let result = async {
            for uri in &command.uris {
                tokio::select! {
                    _ = killer.notified() => {
                        return Err(AgentError::Fetch {
                            container: container_id.clone(),
                            reason: "fetch was killed".to_string(),
                        });
                    }
                    fetched = Self::fetch_one(&uri.value, uri.executable, directory) => {
                        fetched.map_err(|e| AgentError::Fetch {
                            container: container_id.clone(),
                            reason: e.to_string(),
                        })?;
                    }
                }
            }
            Ok(())
        }
        .await;

        self.killed.lock().unwrap().remove(container_id);
        result
    }

    async fn kill(&self, container_id: &ContainerId) {
        info!(container = %container_id, "Killing fetch");
        // notify_one stores a permit, so a kill that lands before the fetch
        // reaches its select still aborts it.
        self.killer(container_id).notify_one();
    }
}

/// Test fetcher: records calls, optionally blocks until killed or released.
#[derive(Default)]
pub struct MockFetcher {
    state: Mutex<MockFetcherState>,
}

#[derive(Default)]
struct MockFetcherState {
    fetched: Vec<ContainerId>,
    killed: Vec<ContainerId>,
    gate: Option<Arc<Notify>>,
    fail: Option<String>,
    cancel: HashMap<ContainerId, Arc<Notify>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetched(&self) -> Vec<ContainerId> {
        self.state.lock().unwrap().fetched.clone()
    }

    pub fn killed(&self) -> Vec<ContainerId> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn fail_next_fetch(&self, reason: &str) {
        self.state.lock().unwrap().fail = Some(reason.to_string());
    }

    /// Make the next fetch block until the returned handle is notified (or
    /// the fetch is killed).
    pub fn gate_fetches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().gate = Some(gate.clone());
        gate
    }
}

#[async_trait::async_trait]
impl ArtifactFetcher for MockFetcher {
    async fn fetch(
        &self,
        container_id: &ContainerId,
        _command: &CommandInfo,
        _directory: &Path,
        _user: Option<&str>,
    ) -> Result<()> {
        let cancel = Arc::new(Notify::new());
        let (gate, fail) = {
            let mut state = self.state.lock().unwrap();
            state.fetched.push(container_id.clone());
            state.cancel.insert(container_id.clone(), cancel.clone());
            (state.gate.take(), state.fail.take())
        };

        if let Some(gate) = gate {
            tokio::select! {
                _ = gate.notified() => {}
                _ = cancel.notified() => {
                    return Err(AgentError::Fetch {
                        container: container_id.clone(),
                        reason: "fetch was killed".to_string(),
                    });
                }
            }
        }

        if let Some(reason) = fail {
            return Err(AgentError::Fetch {
                container: container_id.clone(),
                reason,
            });
        }
        Ok(())
    }

    async fn kill(&self, container_id: &ContainerId) {
        let cancel = {
            let mut state = self.state.lock().unwrap();
            state.killed.push(container_id.clone());
            state.cancel.get(container_id).cloned()
        };
        if let Some(cancel) = cancel {
            cancel.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmesos_spec::CommandUri;

    #[tokio::test]
    async fn copies_local_uris_into_sandbox() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact = tmp.path().join("task.sh");
        tokio::fs::write(&artifact, "#!/bin/sh\necho hi\n").await.unwrap();
        let sandbox = tmp.path().join("sandbox");
        tokio::fs::create_dir_all(&sandbox).await.unwrap();

        let command = CommandInfo {
            uris: vec![CommandUri {
                value: format!("file://{}", artifact.display()),
                executable: true,
                extract: false,
            }],
            ..Default::default()
        };

        let fetcher = UriFetcher::new();
        fetcher
            .fetch(&ContainerId::new("c1"), &command, &sandbox, None)
            .await
            .unwrap();

        let fetched = sandbox.join("task.sh");
        assert!(fetched.exists());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&fetched).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }

    #[tokio::test]
    async fn rejects_remote_schemes() {
        let tmp = tempfile::tempdir().unwrap();
        let command = CommandInfo {
            uris: vec![CommandUri {
                value: "hdfs://namenode/artifact".to_string(),
                executable: false,
                extract: false,
            }],
            ..Default::default()
        };

        let result = UriFetcher::new()
            .fetch(&ContainerId::new("c1"), &command, tmp.path(), None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn kill_aborts_gated_mock_fetch() {
        let fetcher = Arc::new(MockFetcher::new());
        let _gate = fetcher.gate_fetches();

        let id = ContainerId::new("c1");
        let task = {
            let fetcher = fetcher.clone();
            let id = id.clone();
            tokio::spawn(async move {
                fetcher
                    .fetch(&id, &CommandInfo::default(), Path::new("/nowhere"), None)
                    .await
            })
        };

        // Let the fetch reach the gate, then kill it.
        tokio::task::yield_now().await;
        fetcher.kill(&id).await;

        let result = task.await.unwrap();
        assert!(result.is_err());
        assert_eq!(fetcher.killed(), vec![id]);
    }
}
