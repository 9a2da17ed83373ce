//! Task and provenance types
//!
//! Tasks are supplied by the build orchestrator. The cache only reads them to
//! annotate uploads with where an artifact came from.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The project/target pair a task runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTarget {
    /// Orchestrator project name (e.g. `web`)
    pub project: String,
    /// Target name (e.g. `build`)
    pub target: String,
}

/// A unit of build work whose output is cached under `hash`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Cache key of the task's output
    pub hash: String,
    pub target: TaskTarget,
    /// Start time in epoch milliseconds
    #[serde(default)]
    pub start_time: Option<i64>,
}

/// Provenance labels attached to an upload
///
/// Every field is optional: an upload for a hash with no known task simply
/// carries no provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub project_name: Option<String>,
    pub target: Option<String>,
    /// Epoch milliseconds
    pub start_time: Option<i64>,
}

impl Provenance {
    /// Build provenance from the task matching an upload, if any
    pub fn from_task(task: Option<&Task>) -> Self {
        match task {
            Some(task) => Self {
                project_name: Some(task.target.project.clone()),
                target: Some(task.target.target.clone()),
                start_time: task.start_time,
            },
            None => Self::default(),
        }
    }

    /// Parse provenance from raw header values
    ///
    /// An unparsable start time is dropped rather than rejected.
    pub fn from_header_values(
        project_name: Option<&str>,
        target: Option<&str>,
        start_time: Option<&str>,
    ) -> Self {
        let start_time = start_time.and_then(|raw| match raw.trim().parse::<i64>() {
            Ok(ms) => Some(ms),
            Err(e) => {
                debug!(value = raw, error = %e, "Ignoring malformed start time header");
                None
            }
        });

        Self {
            project_name: project_name.map(str::to_string),
            target: target.map(str::to_string),
            start_time,
        }
    }

    /// Start time as a UTC timestamp
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.start_time
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

/// Find the task for a hash
pub fn find_task<'a>(tasks: &'a [Task], hash: &str) -> Option<&'a Task> {
    tasks.iter().find(|task| task.hash == hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task {
            hash: "abc123".to_string(),
            target: TaskTarget {
                project: "web".to_string(),
                target: "build".to_string(),
            },
            start_time: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn test_parse_task_json() {
        let json = r#"{"hash":"abc123","target":{"project":"web","target":"build"},"startTime":1700000000000}"#;
        let parsed: Task = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, task());
    }

    #[test]
    fn test_provenance_from_missing_task() {
        assert_eq!(Provenance::from_task(None), Provenance::default());
    }

    #[test]
    fn test_provenance_from_task() {
        let tasks = vec![task()];
        let provenance = Provenance::from_task(find_task(&tasks, "abc123"));
        assert_eq!(provenance.project_name.as_deref(), Some("web"));
        assert_eq!(provenance.target.as_deref(), Some("build"));
        assert_eq!(
            provenance.started_at().map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn test_malformed_start_time_is_dropped() {
        let provenance = Provenance::from_header_values(Some("web"), None, Some("yesterday"));
        assert_eq!(provenance.project_name.as_deref(), Some("web"));
        assert_eq!(provenance.start_time, None);
    }
}
