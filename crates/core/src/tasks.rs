//! Background task tracker.
//!
//! Running tasks feed a summary indicator. A task that reaches a terminal status is
//! evicted at once, unless the user is inspecting it; in that case it stays for
//! [`TASK_DISPLAY_WINDOW`] so the final status can be read, and the caller is told to
//! schedule the eviction.

use crate::models::{BackgroundTask, TaskSnapshot, TaskStatus};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

pub const TASK_DISPLAY_WINDOW: Duration = Duration::from_secs(3);

/// Outcome of marking a task terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// Not inspected: removed immediately.
    Evicted,
    /// Inspected: kept for the display window.
    Retained,
    /// Unknown id, or already terminal.
    Ignored,
}

#[derive(Debug, Default, Clone)]
pub struct TaskTracker {
    tasks: Vec<BackgroundTask>,
    inspecting: Option<String>,
    snapshot: Vec<TaskSnapshot>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, task_id: &str, description: &str, now: DateTime<Utc>) {
        if self.tasks.iter().any(|t| t.task_id == task_id) {
            debug!(%task_id, "Task already tracked");
            return;
        }
        let snap = self.snapshot.iter().find(|s| s.task_id == task_id);
        self.tasks.push(BackgroundTask {
            task_id: task_id.to_string(),
            description: description.to_string(),
            status: TaskStatus::Running,
            started_at: snap.and_then(|s| s.started_at_utc()).or(Some(now)),
            bound_session_id: snap.and_then(|s| s.oc_session_id.clone()),
        });
    }

    /// Moves a running task to a terminal status. A non-terminal `status` counts as completed.
    pub fn finish(&mut self, task_id: &str, status: TaskStatus) -> Finish {
        let status = if status.is_terminal() {
            status
        } else {
            TaskStatus::Completed
        };
        let Some(idx) = self.tasks.iter().position(|t| t.task_id == task_id) else {
            return Finish::Ignored;
        };
        if self.tasks[idx].status.is_terminal() {
            return Finish::Ignored;
        }
        if self.inspecting.as_deref() == Some(task_id) {
            self.tasks[idx].status = status;
            Finish::Retained
        } else {
            self.tasks.remove(idx);
            Finish::Evicted
        }
    }

    /// Drops a task. Closes the inspector if it was showing it.
    pub fn evict(&mut self, task_id: &str) -> bool {
        if self.inspecting.as_deref() == Some(task_id) {
            self.inspecting = None;
        }
        let before = self.tasks.len();
        self.tasks.retain(|t| t.task_id != task_id);
        before != self.tasks.len()
    }

    pub fn inspect(&mut self, task_id: &str) -> bool {
        if self.tasks.iter().any(|t| t.task_id == task_id) {
            self.inspecting = Some(task_id.to_string());
            true
        } else {
            false
        }
    }

    /// Closes the inspector; a terminal task shown there is evicted with it.
    pub fn close_inspector(&mut self) -> Option<String> {
        let id = self.inspecting.take()?;
        if self
            .get(&id)
            .is_some_and(|task| task.status.is_terminal())
        {
            self.tasks.retain(|t| t.task_id != id);
        }
        Some(id)
    }

    pub fn inspected(&self) -> Option<&BackgroundTask> {
        self.inspecting.as_deref().and_then(|id| self.get(id))
    }

    pub fn get(&self, task_id: &str) -> Option<&BackgroundTask> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn all(&self) -> &[BackgroundTask] {
        &self.tasks
    }

    pub fn running(&self) -> impl Iterator<Item = &BackgroundTask> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
    }

    pub fn running_count(&self) -> usize {
        self.running().count()
    }

    /// Merges a server task listing. Fills start time and bound session, and finishes tasks
    /// the server reports terminal. Returns the ids that were retained for display.
    pub fn apply_snapshot(&mut self, snapshot: Vec<TaskSnapshot>) -> Vec<String> {
        for task in self.tasks.iter_mut() {
            if let Some(snap) = snapshot.iter().find(|s| s.task_id == task.task_id) {
                if let Some(ts) = snap.started_at_utc() {
                    task.started_at = Some(ts);
                }
                if task.bound_session_id.is_none() {
                    task.bound_session_id = snap.oc_session_id.clone();
                }
            }
        }
        let finished: Vec<(String, TaskStatus)> = snapshot
            .iter()
            .map(|s| (s.task_id.clone(), TaskStatus::from_wire(&s.status)))
            .filter(|(_, status)| status.is_terminal())
            .collect();
        self.snapshot = snapshot;

        finished
            .into_iter()
            .filter(|(id, status)| self.finish(id, *status) == Finish::Retained)
            .map(|(id, _)| id)
            .collect()
    }

    /// Session id on the secondary event source: the task's own binding, else the last
    /// server listing.
    pub fn resolve_session(&self, task_id: &str) -> Option<String> {
        self.get(task_id)
            .and_then(|t| t.bound_session_id.clone())
            .or_else(|| {
                self.snapshot
                    .iter()
                    .find(|s| s.task_id == task_id)
                    .and_then(|s| s.oc_session_id.clone())
            })
    }

    pub fn elapsed_secs(&self, task_id: &str, now: DateTime<Utc>) -> Option<u64> {
        let started = self.get(task_id).and_then(|t| t.started_at)?;
        Some((now - started).num_seconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn snap(id: &str, status: &str, session: Option<&str>) -> TaskSnapshot {
        TaskSnapshot {
            task_id: id.to_string(),
            description: String::new(),
            status: status.to_string(),
            started_at: Some(1_714_564_800.0),
            oc_session_id: session.map(str::to_string),
        }
    }

    #[test]
    fn test_uninspected_task_is_evicted_on_finish() {
        let mut tracker = TaskTracker::new();
        tracker.start("t1", "index repo", now());
        assert_eq!(tracker.running_count(), 1);
        assert_eq!(tracker.finish("t1", TaskStatus::Completed), Finish::Evicted);
        assert!(tracker.all().is_empty());
    }

    #[test]
    fn test_inspected_task_is_retained_then_evicted() {
        let mut tracker = TaskTracker::new();
        tracker.start("t1", "index repo", now());
        assert!(tracker.inspect("t1"));
        assert_eq!(tracker.finish("t1", TaskStatus::Error), Finish::Retained);
        assert_eq!(tracker.inspected().unwrap().status, TaskStatus::Error);
        assert_eq!(tracker.running_count(), 0);

        assert!(tracker.evict("t1"));
        assert!(tracker.inspected().is_none());
        assert!(tracker.all().is_empty());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut tracker = TaskTracker::new();
        tracker.start("t1", "x", now());
        tracker.inspect("t1");
        tracker.finish("t1", TaskStatus::Error);
        assert_eq!(tracker.finish("t1", TaskStatus::Completed), Finish::Ignored);
        assert_eq!(tracker.get("t1").unwrap().status, TaskStatus::Error);
    }

    #[test]
    fn test_finish_unknown_task() {
        let mut tracker = TaskTracker::new();
        assert_eq!(tracker.finish("ghost", TaskStatus::Completed), Finish::Ignored);
    }

    #[test]
    fn test_close_inspector_evicts_terminal_task() {
        let mut tracker = TaskTracker::new();
        tracker.start("t1", "x", now());
        tracker.start("t2", "y", now());
        tracker.inspect("t1");
        tracker.finish("t1", TaskStatus::Completed);
        assert_eq!(tracker.close_inspector(), Some("t1".to_string()));
        assert!(tracker.get("t1").is_none());

        tracker.inspect("t2");
        tracker.close_inspector();
        assert!(tracker.get("t2").is_some());
    }

    #[test]
    fn test_snapshot_resolves_session_and_start_time() {
        let mut tracker = TaskTracker::new();
        tracker.start("t1", "x", now());
        assert_eq!(tracker.resolve_session("t1"), None);

        let retained = tracker.apply_snapshot(vec![snap("t1", "running", Some("ses_1"))]);
        assert!(retained.is_empty());
        assert_eq!(tracker.resolve_session("t1"), Some("ses_1".to_string()));
        assert_eq!(
            tracker.get("t1").unwrap().started_at,
            Utc.timestamp_opt(1_714_564_800, 0).single()
        );
        assert_eq!(
            tracker.elapsed_secs("t1", Utc.timestamp_opt(1_714_564_865, 0).unwrap()),
            Some(65)
        );
    }

    #[test]
    fn test_snapshot_finishes_missed_completions() {
        let mut tracker = TaskTracker::new();
        tracker.start("t1", "x", now());
        tracker.start("t2", "y", now());
        tracker.inspect("t2");
        let retained = tracker.apply_snapshot(vec![
            snap("t1", "completed", None),
            snap("t2", "error", None),
        ]);
        assert_eq!(retained, vec!["t2".to_string()]);
        assert!(tracker.get("t1").is_none());
        assert_eq!(tracker.get("t2").unwrap().status, TaskStatus::Error);
    }

    #[test]
    fn test_task_started_after_snapshot_picks_up_binding() {
        let mut tracker = TaskTracker::new();
        tracker.apply_snapshot(vec![snap("t9", "running", Some("ses_9"))]);
        tracker.start("t9", "late", now());
        assert_eq!(
            tracker.get("t9").unwrap().bound_session_id.as_deref(),
            Some("ses_9")
        );
    }
}
