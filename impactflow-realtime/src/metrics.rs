//! Project metrics recomputed after task mutations.
//!
//! The hub never computes metrics itself: it hands every task mutation to a
//! [`MetricsProvider`] on a background task and broadcasts whatever snapshot
//! comes back as `metricsUpdated`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::protocol::{ProjectId, ProjectMetrics, TaskId};

/// A task change relayed through a project room.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskMutation {
    Created { task: Value },
    Updated { task_id: TaskId, changes: Value },
    Deleted { task_id: TaskId },
}

/// Source of project metrics snapshots.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Return a fresh snapshot for `project_id`, or `None` to skip the
    /// `metricsUpdated` broadcast.
    async fn recompute(&self, project_id: &str, mutation: &TaskMutation) -> Option<ProjectMetrics>;
}

/// Provider that never publishes metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetrics;

#[async_trait]
impl MetricsProvider for NoMetrics {
    async fn recompute(&self, _project_id: &str, _mutation: &TaskMutation) -> Option<ProjectMetrics> {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct TaskFacts {
    percent_complete: f64,
    status: Option<String>,
    critical_path: bool,
    resource_load: Option<f64>,
}

impl TaskFacts {
    fn merge(&mut self, fields: &Value) {
        if let Some(pct) = fields.get("percentComplete").and_then(Value::as_f64) {
            self.percent_complete = pct.clamp(0.0, 100.0);
        }
        if let Some(status) = fields.get("status").and_then(Value::as_str) {
            self.status = Some(status.to_string());
        }
        if let Some(critical) = fields.get("criticalPath").and_then(Value::as_bool) {
            self.critical_path = critical;
        }
        if let Some(load) = fields.get("resourceLoad").and_then(Value::as_f64) {
            self.resource_load = Some(load);
        }
    }

    fn has_status(&self, status: &str) -> bool {
        self.status.as_deref() == Some(status)
    }
}

/// In-memory metrics derived from the task events seen since startup.
///
/// Only tasks that flowed through the server are counted; a real
/// deployment plugs in a provider backed by the project store.
#[derive(Debug, Default)]
pub struct TaskTally {
    projects: Mutex<HashMap<ProjectId, HashMap<TaskId, TaskFacts>>>,
}

impl TaskTally {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(project_id: &str, tasks: &HashMap<TaskId, TaskFacts>) -> ProjectMetrics {
        let total = tasks.len() as u32;
        let count = |status: &str| tasks.values().filter(|t| t.has_status(status)).count() as u32;
        let completed = count("Complete");
        let blocked = count("Blocked");
        let overdue = count("Delayed");
        let critical = tasks.values().filter(|t| t.critical_path).count() as u32;

        let overall_progress = if total == 0 {
            0.0
        } else {
            tasks.values().map(|t| t.percent_complete).sum::<f64>() / total as f64
        };
        let health_score = if total == 0 {
            100.0
        } else {
            100.0 * (1.0 - f64::from(blocked + overdue) / f64::from(total))
        };
        let loads: Vec<f64> = tasks.values().filter_map(|t| t.resource_load).collect();
        let resource_utilization = if loads.is_empty() {
            0.0
        } else {
            loads.iter().sum::<f64>() / loads.len() as f64
        };
        let burndown_rate = if total == 0 {
            0.0
        } else {
            100.0 * f64::from(completed) / f64::from(total)
        };

        ProjectMetrics {
            project_id: project_id.to_string(),
            overall_progress,
            tasks_completed: completed,
            tasks_total: total,
            health_score,
            critical_path_tasks: critical,
            blocked_tasks: blocked,
            overdue_tasks: overdue,
            team_velocity: f64::from(completed),
            burndown_rate,
            resource_utilization,
        }
    }
}

#[async_trait]
impl MetricsProvider for TaskTally {
    async fn recompute(&self, project_id: &str, mutation: &TaskMutation) -> Option<ProjectMetrics> {
        let mut projects = self.projects.lock().await;
        let tasks = projects.entry(project_id.to_string()).or_default();

        match mutation {
            TaskMutation::Created { task } => {
                let id = task.get("id").and_then(Value::as_str)?;
                let mut facts = TaskFacts::default();
                facts.merge(task);
                tasks.insert(id.to_string(), facts);
            }
            TaskMutation::Updated { task_id, changes } => {
                tasks.entry(task_id.clone()).or_default().merge(changes);
            }
            TaskMutation::Deleted { task_id } => {
                tasks.remove(task_id);
            }
        }

        Some(Self::snapshot(project_id, tasks))
    }
}
