//! Docker container name codec.
//!
//! Containers started by the agent are named `mesos-<slaveId>.<containerId>`
//! so that recovery can tell them apart from containers started by anything
//! else on the host. Executor-helper containers carry a trailing `.executor`
//! token. Agents older than 0.23 named containers `mesos-<containerId>`; that
//! form still parses for one deprecation cycle.

use rmesos_spec::{ContainerId, SlaveId};

/// Prefix shared by every container the agent starts.
pub const DOCKER_NAME_PREFIX: &str = "mesos-";

/// Separator between the slave id, container id, and executor token.
pub const DOCKER_NAME_SEPARATOR: char = '.';

/// Trailing token of an executor-helper container name.
const EXECUTOR_SUFFIX: &str = "executor";

/// Name of the container that runs the task or executor.
pub fn container_name(slave_id: &SlaveId, container_id: &ContainerId) -> String {
    format!("{DOCKER_NAME_PREFIX}{slave_id}{DOCKER_NAME_SEPARATOR}{container_id}")
}

/// Name of the container that runs the executor helper, when the agent itself
/// is containerized.
pub fn executor_container_name(slave_id: &SlaveId, container_id: &ContainerId) -> String {
    format!(
        "{}{}{}",
        container_name(slave_id, container_id),
        DOCKER_NAME_SEPARATOR,
        EXECUTOR_SUFFIX
    )
}

/// Whether a Docker name refers to an executor-helper container.
pub fn is_executor_container(name: &str) -> bool {
    name.contains(".executor")
}

/// Parse the ContainerID out of a Docker container name.
///
/// Accepts both the unprefixed and leading-slash forms the Docker API hands
/// back. Returns `None` for containers the agent did not start; recovery
/// ignores those.
pub fn parse(name: &str) -> Option<ContainerId> {
    let name = name.strip_prefix('/').unwrap_or(name);
    let name = name.strip_prefix(DOCKER_NAME_PREFIX)?;

    if !name.contains(DOCKER_NAME_SEPARATOR) {
        // Pre-0.23 form with no slave id.
        return Some(ContainerId::new(name));
    }

    let parts: Vec<&str> = name.split(DOCKER_NAME_SEPARATOR).collect();
    match parts.len() {
        2 | 3 => Some(ContainerId::new(parts[1])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_current_form() {
        let slave = SlaveId::new("20260801-000000-1-0");
        let id = ContainerId::new("c4f2b8a0");

        let name = container_name(&slave, &id);
        assert_eq!(name, "mesos-20260801-000000-1-0.c4f2b8a0");
        assert_eq!(parse(&name), Some(id.clone()));

        // The Docker API sometimes reports names with a leading slash.
        assert_eq!(parse(&format!("/{name}")), Some(id));
    }

    #[test]
    fn parses_executor_container_names() {
        let slave = SlaveId::new("s1");
        let id = ContainerId::new("abc");

        let name = executor_container_name(&slave, &id);
        assert_eq!(name, "mesos-s1.abc.executor");
        assert!(is_executor_container(&name));
        assert!(!is_executor_container("mesos-s1.abc"));
        assert_eq!(parse(&name), Some(id));
    }

    #[test]
    fn parses_legacy_form() {
        assert_eq!(parse("mesos-abc"), Some(ContainerId::new("abc")));
        assert_eq!(parse("/mesos-abc"), Some(ContainerId::new("abc")));
    }

    #[test]
    fn ignores_foreign_containers() {
        assert_eq!(parse("jolly_ptolemy"), None);
        assert_eq!(parse("/registry"), None);
        assert_eq!(parse("mesos-a.b.c.d"), None);
    }
}
