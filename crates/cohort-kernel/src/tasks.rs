use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::error::{conflict_or, KernelError, Result};
use crate::model::{format_ts, parse_ts, parse_ts_opt, Owner, TaskStatus};
use crate::Kernel;

const TASK_COLUMNS: &str = "task_id,owner,status,priority,correlation_id,source,description,context,notes,created_at,updated_at,completed_at";

/// Why a task exists.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    /// Seed task created when a ticket was claimed.
    Claim,
    /// Follow-up task for a ticket the occurrence already owns.
    Continuation,
    /// One-shot shared decision (wakeup, shutdown, rollout).
    Ritual,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Claim => "claim",
            TaskSource::Continuation => "continuation",
            TaskSource::Ritual => "ritual",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value {
            "claim" => Some(TaskSource::Claim),
            "continuation" => Some(TaskSource::Continuation),
            "ritual" => Some(TaskSource::Ritual),
            _ => None,
        }
    }
}

impl fmt::Display for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub owner: Owner,
    pub status: TaskStatus,
    pub priority: i64,
    /// Ticket id or ritual key this task works on.
    pub correlation_id: Option<String>,
    pub source: TaskSource,
    pub description: String,
    pub context: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub owner: Owner,
    pub status: TaskStatus,
    pub priority: i64,
    pub correlation_id: Option<String>,
    pub source: TaskSource,
    pub description: String,
    pub context: serde_json::Value,
}

impl NewTask {
    pub fn new(task_id: impl Into<String>, owner: Owner, source: TaskSource) -> Self {
        Self {
            task_id: task_id.into(),
            owner,
            status: TaskStatus::Pending,
            priority: 0,
            correlation_id: None,
            source,
            description: String::new(),
            context: serde_json::json!({}),
        }
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

struct RawTask {
    task_id: String,
    owner: String,
    status: String,
    priority: i64,
    correlation_id: Option<String>,
    source: String,
    description: String,
    context: String,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            owner: row.get(1)?,
            status: row.get(2)?,
            priority: row.get(3)?,
            correlation_id: row.get(4)?,
            source: row.get(5)?,
            description: row.get(6)?,
            context: row.get(7)?,
            notes: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            completed_at: row.get(11)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        Ok(Task {
            owner: Owner::parse(&self.owner)?,
            status: TaskStatus::from_slug(&self.status)
                .ok_or_else(|| KernelError::corrupt("tasks.status", &self.status))?,
            source: TaskSource::from_slug(&self.source)
                .ok_or_else(|| KernelError::corrupt("tasks.source", &self.source))?,
            context: serde_json::from_str(&self.context).unwrap_or(serde_json::json!({})),
            created_at: parse_ts("tasks.created_at", &self.created_at)?,
            updated_at: parse_ts("tasks.updated_at", &self.updated_at)?,
            completed_at: parse_ts_opt("tasks.completed_at", self.completed_at)?,
            task_id: self.task_id,
            priority: self.priority,
            correlation_id: self.correlation_id,
            description: self.description,
            notes: self.notes,
        })
    }
}

#[derive(Clone)]
pub struct TaskRegistry {
    kernel: Kernel,
}

impl TaskRegistry {
    pub(crate) fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }

    /// Insert a task unless its id, or an ACTIVE task for the same
    /// (correlation, owner), already exists. Returns `None` in that case.
    pub fn insert(&self, task: &NewTask, now: DateTime<Utc>) -> Result<Option<Task>> {
        let conn = self.kernel.conn()?;
        let now_s = format_ts(now);
        let n = conn.execute(
            "INSERT OR IGNORE INTO tasks(task_id,owner,status,priority,correlation_id,source,description,context,created_at,updated_at) VALUES(?,?,?,?,?,?,?,?,?,?)",
            params![
                task.task_id,
                task.owner.as_str(),
                task.status.as_str(),
                task.priority,
                task.correlation_id,
                task.source.as_str(),
                task.description,
                serde_json::to_string(&task.context)?,
                now_s,
                now_s
            ],
        )?;
        if n == 0 {
            return Ok(None);
        }
        self.get(&task.task_id)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.kernel.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id=?"),
                [task_id],
                RawTask::from_row,
            )
            .optional()?;
        raw.map(RawTask::into_task).transpose()
    }

    /// The single path for task status changes.
    pub fn set_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        owner: Option<&Owner>,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let mut conn = self.kernel.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row("SELECT status FROM tasks WHERE task_id=?", [task_id], |r| {
                r.get(0)
            })
            .optional()?;
        let current = current.ok_or_else(|| KernelError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        })?;
        let from = TaskStatus::from_slug(&current)
            .ok_or_else(|| KernelError::corrupt("tasks.status", &current))?;
        if !from.can_transition_to(status) {
            return Err(KernelError::InvalidTransition {
                entity: "task",
                id: task_id.to_string(),
                from: from.to_string(),
                to: status.to_string(),
            });
        }
        let now_s = format_ts(now);
        let completed = status.is_terminal().then(|| now_s.clone());
        tx.execute(
            "UPDATE tasks SET status=?, owner=COALESCE(?,owner), notes=COALESCE(?,notes), updated_at=?, completed_at=COALESCE(?,completed_at) WHERE task_id=? AND status=?",
            params![
                status.as_str(),
                owner.map(|o| o.as_str()),
                notes,
                now_s,
                completed,
                task_id,
                current
            ],
        )
        .map_err(|e| conflict_or(e, "task", task_id))?;
        tx.commit()?;
        self.get(task_id)?.ok_or_else(|| KernelError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        })
    }

    /// The ACTIVE task working on `correlation_id`, whoever owns it.
    pub fn active_for_correlation(&self, correlation_id: &str) -> Result<Option<Task>> {
        let conn = self.kernel.conn()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE correlation_id=? AND status='active' ORDER BY created_at DESC LIMIT 1"
                ),
                [correlation_id],
                RawTask::from_row,
            )
            .optional()?;
        raw.map(RawTask::into_task).transpose()
    }

    pub fn by_correlation(&self, correlation_id: &str) -> Result<Vec<Task>> {
        self.query(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE correlation_id=? ORDER BY created_at ASC"
            ),
            params![correlation_id],
        )
    }

    pub fn list_for_owner(&self, owner: &Owner, limit: i64) -> Result<Vec<Task>> {
        self.query(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE owner=? ORDER BY created_at DESC LIMIT ?"
            ),
            params![owner.as_str(), limit],
        )
    }

    /// ACTIVE tasks of `owner` not updated since `before`.
    pub fn stale_active(&self, owner: &Owner, before: DateTime<Utc>) -> Result<Vec<Task>> {
        self.query(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE owner=? AND status='active' AND updated_at < ? ORDER BY updated_at ASC"
            ),
            params![owner.as_str(), format_ts(before)],
        )
    }

    /// Most recent task whose id starts with `prefix`, created at or after `since`.
    pub fn latest_with_prefix(&self, prefix: &str, since: DateTime<Utc>) -> Result<Option<Task>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut found = self.query(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE task_id LIKE ? ESCAPE '\\' AND created_at >= ? ORDER BY created_at DESC LIMIT 1"
            ),
            params![pattern, format_ts(since)],
        )?;
        Ok(found.pop())
    }

    /// Delete only if the row is still exactly as observed (same `updated_at`).
    pub fn delete_if_unchanged(&self, task: &Task) -> Result<bool> {
        let conn = self.kernel.conn()?;
        let n = conn.execute(
            "DELETE FROM tasks WHERE task_id=? AND status=? AND updated_at=?",
            params![
                task.task_id,
                task.status.as_str(),
                format_ts(task.updated_at)
            ],
        )?;
        Ok(n == 1)
    }

    /// Bump `updated_at` on a non-terminal task so it is not mistaken for abandoned work.
    pub fn touch(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.kernel.conn()?;
        let n = conn.execute(
            "UPDATE tasks SET updated_at=? WHERE task_id=? AND status IN ('pending','active')",
            params![format_ts(now), task_id],
        )?;
        Ok(n == 1)
    }

    pub fn count_by_status(&self, status: TaskStatus) -> Result<i64> {
        let conn = self.kernel.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(1) FROM tasks WHERE status=?",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Task>> {
        let conn = self.kernel.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, RawTask::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawTask::into_task).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use chrono::Duration;

    fn active(id: &str, corr: &str, owner: &str) -> NewTask {
        NewTask::new(id, Owner::from(occ(owner)), TaskSource::Claim)
            .status(TaskStatus::Active)
            .correlation(corr)
    }

    #[test]
    fn second_active_task_for_same_correlation_is_refused() {
        let (_dir, kernel) = kernel();
        let tasks = kernel.tasks();
        assert!(tasks.insert(&active("a", "T1", "occ-1"), noon()).unwrap().is_some());
        assert!(tasks.insert(&active("b", "T1", "occ-1"), noon()).unwrap().is_none());
        // same correlation, different owner is a different pair
        assert!(tasks.insert(&active("c", "T1", "occ-2"), noon()).unwrap().is_some());
        // duplicate id
        assert!(tasks.insert(&active("a", "T9", "occ-1"), noon()).unwrap().is_none());

        let found = tasks.active_for_correlation("T1").unwrap().unwrap();
        assert_eq!(found.correlation_id.as_deref(), Some("T1"));
        assert_eq!(tasks.by_correlation("T1").unwrap().len(), 2);
    }

    #[test]
    fn set_status_enforces_table_and_stamps_completion() {
        let (_dir, kernel) = kernel();
        let tasks = kernel.tasks();
        let new = NewTask::new("r1", Owner::Shared, TaskSource::Ritual);
        tasks.insert(&new, noon()).unwrap();

        let err = tasks
            .set_status("r1", TaskStatus::Completed, None, None, noon())
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidTransition { .. }));

        let later = noon() + Duration::minutes(3);
        let task = tasks
            .set_status("r1", TaskStatus::Active, None, None, noon())
            .unwrap();
        assert!(task.completed_at.is_none());
        let task = tasks
            .set_status("r1", TaskStatus::Completed, None, Some("done"), later)
            .unwrap();
        assert_eq!(task.completed_at, Some(later));
        assert_eq!(task.notes.as_deref(), Some("done"));
        assert_eq!(task.owner, Owner::Shared);

        let missing = tasks
            .set_status("nope", TaskStatus::Active, None, None, noon())
            .unwrap_err();
        assert!(matches!(missing, KernelError::NotFound { .. }));
    }

    #[test]
    fn activating_duplicate_pending_task_is_a_conflict() {
        let (_dir, kernel) = kernel();
        let tasks = kernel.tasks();
        tasks.insert(&active("a", "T1", "occ-1"), noon()).unwrap();
        let pending = NewTask::new("b", Owner::from(occ("occ-1")), TaskSource::Continuation)
            .correlation("T1");
        tasks.insert(&pending, noon()).unwrap();
        let err = tasks
            .set_status("b", TaskStatus::Active, None, None, noon())
            .unwrap_err();
        assert!(matches!(err, KernelError::Conflict { .. }));
    }

    #[test]
    fn prefix_lookup_escapes_wildcards_and_honours_window() {
        let (_dir, kernel) = kernel();
        let tasks = kernel.tasks();
        let old = noon() - Duration::hours(48);
        tasks
            .insert(&NewTask::new("WAKEUP_SHARED_20251105", Owner::Shared, TaskSource::Ritual), old)
            .unwrap();
        tasks
            .insert(&NewTask::new("WAKEUPXSHAREDX", Owner::Shared, TaskSource::Ritual), noon())
            .unwrap();

        let since = noon() - Duration::hours(24);
        assert!(tasks.latest_with_prefix("WAKEUP_SHARED_", since).unwrap().is_none());
        let wide = noon() - Duration::hours(72);
        let found = tasks.latest_with_prefix("WAKEUP_SHARED_", wide).unwrap().unwrap();
        assert_eq!(found.task_id, "WAKEUP_SHARED_20251105");
    }

    #[test]
    fn touch_and_conditional_delete_track_updated_at() {
        let (_dir, kernel) = kernel();
        let tasks = kernel.tasks();
        let seen = tasks
            .insert(&NewTask::new("r1", Owner::Shared, TaskSource::Ritual), noon())
            .unwrap()
            .unwrap();
        assert!(tasks.touch("r1", noon() + Duration::minutes(1)).unwrap());
        assert!(!tasks.delete_if_unchanged(&seen).unwrap());

        let fresh = tasks.get("r1").unwrap().unwrap();
        assert_eq!(fresh.updated_at, noon() + Duration::minutes(1));
        assert!(tasks.delete_if_unchanged(&fresh).unwrap());
        assert!(!tasks.touch("r1", noon()).unwrap());
    }

    #[test]
    fn stale_active_lists_only_untouched_tasks_of_owner() {
        let (_dir, kernel) = kernel();
        let tasks = kernel.tasks();
        tasks
            .insert(&active("old", "T1", "occ-1"), noon() - Duration::hours(1))
            .unwrap();
        tasks.insert(&active("new", "T2", "occ-1"), noon()).unwrap();
        tasks
            .insert(&active("other", "T3", "occ-2"), noon() - Duration::hours(1))
            .unwrap();
        let stale = tasks
            .stale_active(&Owner::from(occ("occ-1")), noon() - Duration::minutes(10))
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].task_id, "old");
        assert_eq!(tasks.count_by_status(TaskStatus::Active).unwrap(), 3);
    }
}
