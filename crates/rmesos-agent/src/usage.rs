//! Resource usage sampling
//!
//! `usage()` resolves the container's init pid and samples its CPU time and
//! resident memory. The init process reaps everything inside the container,
//! so the root pid alone accounts for the whole container.

use crate::error::{AgentError, Result};
use rmesos_spec::ResourceStatistics;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seam for per-pid usage sampling.
#[async_trait::async_trait]
pub trait UsageProbe: Send + Sync {
    async fn usage(&self, pid: i32) -> Result<ResourceStatistics>;
}

/// `/proc`-backed probe.
#[derive(Debug, Default)]
pub struct ProcUsage;

impl ProcUsage {
    pub fn new() -> Self {
        Self
    }
}

/// The fields of `/proc/<pid>/stat` the probe consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    /// User-mode time, in clock ticks.
    utime: u64,
    /// Kernel-mode time, in clock ticks.
    stime: u64,
    /// Resident set size, in pages.
    rss: u64,
}

/// Parse a `/proc/<pid>/stat` line.
///
/// The second field (comm) is parenthesized and may contain spaces, so
/// splitting only starts after the closing paren.
fn parse_stat(content: &str) -> Option<ProcStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // Fields here are offset by the two leading fields (pid, comm):
    // utime is stat field 14, stime 15, rss 24.
    Some(ProcStat {
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        rss: fields.get(21)?.parse().ok()?,
    })
}

fn clock_ticks_per_second() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

#[async_trait::async_trait]
impl UsageProbe for ProcUsage {
    async fn usage(&self, pid: i32) -> Result<ResourceStatistics> {
        let path = format!("/proc/{pid}/stat");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AgentError::Usage {
                reason: format!("failed to read {path}: {e}"),
            })?;

        let stat = parse_stat(&content).ok_or_else(|| AgentError::Usage {
            reason: format!("malformed {path}"),
        })?;

        let ticks = clock_ticks_per_second();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Ok(ResourceStatistics {
            timestamp,
            cpus_user_time_secs: Some(stat.utime as f64 / ticks),
            cpus_system_time_secs: Some(stat.stime as f64 / ticks),
            mem_rss_bytes: Some(stat.rss * page_size()),
            ..Default::default()
        })
    }
}

/// Test probe returning a canned sample.
#[derive(Default)]
pub struct MockUsage {
    statistics: Mutex<ResourceStatistics>,
}

impl MockUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_statistics(&self, statistics: ResourceStatistics) {
        *self.statistics.lock().unwrap() = statistics;
    }
}

#[async_trait::async_trait]
impl UsageProbe for MockUsage {
    async fn usage(&self, _pid: i32) -> Result<ResourceStatistics> {
        Ok(self.statistics.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_line() {
        // A comm with spaces and parens is the parser's worst case.
        let line = "4711 (tokio runtime (x)) S 1 4711 4711 0 -1 4194560 \
                    1234 0 0 0 250 50 0 0 20 0 4 0 100000 222222222 7890 \
                    18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";

        let stat = parse_stat(line).unwrap();
        assert_eq!(stat.utime, 250);
        assert_eq!(stat.stime, 50);
        assert_eq!(stat.rss, 7890);
    }

    #[test]
    fn rejects_malformed_stat() {
        assert_eq!(parse_stat("not a stat line"), None);
        assert_eq!(parse_stat("1 (x) S 1 2"), None);
    }

    #[tokio::test]
    async fn samples_own_process() {
        let probe = ProcUsage::new();
        let statistics = probe.usage(std::process::id() as i32).await.unwrap();

        assert!(statistics.timestamp > 0.0);
        assert!(statistics.mem_rss_bytes.unwrap() > 0);
        assert!(statistics.cpus_user_time_secs.is_some());
    }
}
