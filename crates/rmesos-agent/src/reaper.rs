//! Executor pid reaping
//!
//! The containerizer arms a watch on every executor pid it knows about; when
//! the watch resolves, teardown runs. Pids fall in two classes: children we
//! forked ourselves (real wait status available) and foreign pids adopted
//! during recovery (existence can only be polled, status is lost).

use std::io;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::oneshot;

/// Resolves with the pid's exit status, or `None` when none could be
/// collected (foreign pid, or the wait itself failed).
pub type StatusRx = oneshot::Receiver<Option<i32>>;

/// How often foreign pids are polled for existence.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Whether a process with this pid currently exists.
pub fn pid_exists(pid: i32) -> bool {
    // Signal 0 performs the permission and existence checks only. EPERM
    // still means the process is there.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Normalize an exit status to the shell convention: the exit code, or
/// 128 + signal for signal deaths.
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| 128 + s))
}

/// Watch a child we spawned; resolves with its real exit status.
pub fn watch_child(mut child: Child) -> StatusRx {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => exit_code(status),
            Err(_) => None,
        };
        let _ = tx.send(status);
    });
    rx
}

/// Pid monitoring and signalling operations, mockable for tests.
pub trait Reaper: Send + Sync {
    /// Whether the pid currently exists.
    fn exists(&self, pid: i32) -> bool;

    /// Watch a pid that is not our child. Resolves with `None` once the pid
    /// is gone; a foreign pid's exit status cannot be recovered.
    fn watch(&self, pid: i32) -> StatusRx;

    /// Deliver `signal` to the pid's process tree.
    fn kill_tree(&self, pid: i32, signal: i32) -> io::Result<()>;
}

/// The real thing.
#[derive(Debug, Default)]
pub struct OsReaper;

impl OsReaper {
    pub fn new() -> Self {
        Self
    }
}

impl Reaper for OsReaper {
    fn exists(&self, pid: i32) -> bool {
        pid_exists(pid)
    }

    fn watch(&self, pid: i32) -> StatusRx {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            while pid_exists(pid) {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            let _ = tx.send(None);
        });
        rx
    }

    fn kill_tree(&self, pid: i32, signal: i32) -> io::Result<()> {
        // The executor helper runs in its own session (setsid at launch), so
        // its process group id equals its pid and one group signal reaches
        // the whole tree. Fall back to the single pid for anything that is
        // not a group leader.
        let result = unsafe { libc::kill(-pid, signal) };
        if result == 0 {
            return Ok(());
        }

        let result = unsafe { libc::kill(pid, signal) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Test reaper: pid liveness is scripted, kills are recorded, watches are
/// completed by the test.
#[derive(Default)]
pub struct MockReaper {
    state: Mutex<MockReaperState>,
}

#[derive(Default)]
struct MockReaperState {
    live: std::collections::HashSet<i32>,
    kills: Vec<(i32, i32)>,
    watches: std::collections::HashMap<i32, oneshot::Sender<Option<i32>>>,
}

impl MockReaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alive(&self, pid: i32) {
        self.state.lock().unwrap().live.insert(pid);
    }

    pub fn kills(&self) -> Vec<(i32, i32)> {
        self.state.lock().unwrap().kills.clone()
    }

    /// Resolve an armed watch.
    pub fn complete(&self, pid: i32, status: Option<i32>) {
        let sender = self.state.lock().unwrap().watches.remove(&pid);
        if let Some(sender) = sender {
            let _ = sender.send(status);
        }
    }
}

impl Reaper for MockReaper {
    fn exists(&self, pid: i32) -> bool {
        self.state.lock().unwrap().live.contains(&pid)
    }

    fn watch(&self, pid: i32) -> StatusRx {
        let (tx, rx) = oneshot::channel();
        self.state.lock().unwrap().watches.insert(pid, tx);
        rx
    }

    fn kill_tree(&self, pid: i32, signal: i32) -> io::Result<()> {
        self.state.lock().unwrap().kills.push((pid, signal));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn our_own_pid_exists() {
        assert!(pid_exists(std::process::id() as i32));
    }

    #[test]
    fn out_of_range_pid_does_not_exist() {
        assert!(!pid_exists(i32::MAX));
    }

    #[tokio::test]
    async fn watch_child_reports_exit_code() {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "exit 7"])
            .spawn()
            .unwrap();

        let status = watch_child(child).await.unwrap();
        assert_eq!(status, Some(7));
    }

    #[tokio::test]
    async fn watch_child_reports_signal_deaths() {
        let child = tokio::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap() as i32;

        let rx = watch_child(child);
        OsReaper::new().kill_tree(pid, libc::SIGKILL).unwrap();

        let status = rx.await.unwrap();
        assert_eq!(status, Some(128 + libc::SIGKILL));
    }

    #[tokio::test]
    async fn os_reaper_watch_resolves_when_pid_dies() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap() as i32;

        let reaper = OsReaper::new();
        assert!(reaper.exists(pid));

        let rx = reaper.watch(pid);
        child.kill().await.unwrap();
        // Collect the zombie so the pid actually disappears.
        child.wait().await.unwrap();

        assert_eq!(rx.await.unwrap(), None);
    }
}
