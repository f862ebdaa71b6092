//! One-shot shared decisions ("rituals") such as wakeup or shutdown.
//!
//! The ritual key doubles as the task id (`WAKEUP_SHARED_20251107`); the task
//! row is owned by the shared sentinel so every occurrence can observe how the
//! decision went, while the claim row records which occurrence acts on it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cohort_kernel::{Kernel, NewTask, OccurrenceId, Owner, Task, TaskSource, TaskStatus};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::claim::{ClaimCoordinator, ClaimKey, ClaimOutcome};
use crate::context::OccurrenceContext;
use crate::error::Result;
use crate::journal::Journal;

/// Floor for polling periods; `tokio::time::interval` rejects zero.
const MIN_POLL: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedTaskOptions {
    /// PENDING/ACTIVE ritual work untouched for this long is treated as abandoned.
    pub resume_stuck_after: Duration,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    /// Default look-back for "did this ritual already happen".
    pub ritual_window: Duration,
}

impl Default for SharedTaskOptions {
    fn default() -> Self {
        Self {
            resume_stuck_after: Duration::from_secs(600),
            wait_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            ritual_window: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SharedClaim {
    /// The caller holds the claim and created the task row.
    Created(Task),
    /// The caller holds the claim; the task row already existed.
    Resumed(Task),
    /// Another occurrence holds the claim.
    HeldElsewhere {
        owner: OccurrenceId,
        task: Option<Task>,
    },
}

impl SharedClaim {
    pub fn created(&self) -> bool {
        matches!(self, SharedClaim::Created(_))
    }

    pub fn is_ours(&self) -> bool {
        !matches!(self, SharedClaim::HeldElsewhere { .. })
    }

    pub fn task(&self) -> Option<&Task> {
        match self {
            SharedClaim::Created(task) | SharedClaim::Resumed(task) => Some(task),
            SharedClaim::HeldElsewhere { task, .. } => task.as_ref(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SharedTaskWait {
    Completed(Task),
    Failed(Task),
    TimedOut,
}

#[derive(Clone)]
pub struct SharedTasks {
    kernel: Kernel,
    claims: ClaimCoordinator,
    journal: Journal,
    options: SharedTaskOptions,
}

fn key_prefix(kind: &str) -> String {
    format!("{}_SHARED_", kind.trim().to_ascii_uppercase())
}

fn chrono_span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl SharedTasks {
    pub fn new(
        kernel: Kernel,
        claims: ClaimCoordinator,
        journal: Journal,
        options: SharedTaskOptions,
    ) -> Self {
        Self {
            kernel,
            claims,
            journal,
            options,
        }
    }

    pub fn options(&self) -> &SharedTaskOptions {
        &self.options
    }

    /// Today's key for `kind` according to the context clock.
    pub fn key_for(&self, kind: &str, ctx: &OccurrenceContext) -> ClaimKey {
        ClaimKey::ritual(kind, ctx.now().date_naive())
    }

    /// Claim today's ritual for `kind`, creating its shared task if this
    /// occurrence wins. Stale leftovers under the same key are cleared and
    /// the claim retried once.
    pub fn claim_shared_task(
        &self,
        kind: &str,
        description: &str,
        priority: i64,
        ctx: &OccurrenceContext,
    ) -> Result<SharedClaim> {
        let key = self.key_for(kind, ctx);
        if self.reclaim_if_stale(&key, ctx)? {
            debug!(target: "cohort::shared", key = %key, "stale ritual cleared before claim");
        }
        let outcome = self.claims.try_claim(&key, ctx)?;
        if !outcome.owned_by_caller() {
            let task = self.kernel.tasks().get(key.as_str())?;
            return Ok(SharedClaim::HeldElsewhere {
                owner: outcome.owner().clone(),
                task,
            });
        }
        self.ensure_task(&key, &outcome, description, priority, ctx)
    }

    fn ensure_task(
        &self,
        key: &ClaimKey,
        outcome: &ClaimOutcome,
        description: &str,
        priority: i64,
        ctx: &OccurrenceContext,
    ) -> Result<SharedClaim> {
        let tasks = self.kernel.tasks();
        let new = NewTask::new(key.as_str(), Owner::Shared, TaskSource::Ritual)
            .priority(priority)
            .correlation(key.as_str())
            .description(description)
            .context(json!({
                "claimed_by": outcome.owner(),
                "claimed_at": cohort_kernel::format_ts(outcome.claimed_at()),
            }));
        match tasks.insert(&new, ctx.now())? {
            Some(task) => {
                info!(
                    target: "cohort::shared",
                    key = %key,
                    occurrence = %ctx.occurrence_id(),
                    "shared task created"
                );
                self.journal.record(
                    cohort_topics::TOPIC_TASK_CREATED,
                    ctx.occurrence_id().as_str(),
                    ctx.now(),
                    &json!({ "corr_id": key.as_str(), "task_id": task.task_id, "source": "ritual" }),
                );
                Ok(SharedClaim::Created(task))
            }
            None => match tasks.get(key.as_str())? {
                Some(task) => Ok(SharedClaim::Resumed(task)),
                None => Err(cohort_kernel::KernelError::NotFound {
                    entity: "task",
                    id: key.to_string(),
                }
                .into()),
            },
        }
    }

    /// Remove a finished or abandoned ritual under `key` so it can be claimed
    /// afresh. Both deletes are conditional on the rows still being the ones
    /// observed here.
    fn reclaim_if_stale(&self, key: &ClaimKey, ctx: &OccurrenceContext) -> Result<bool> {
        let now = ctx.now();
        let stuck_after = chrono_span(self.options.resume_stuck_after);
        let tasks = self.kernel.tasks();
        let holder = self.claims.holder(key)?;
        let task = tasks.get(key.as_str())?;

        let stale = match (&task, &holder) {
            (Some(task), _) => task.status.is_terminal() || now - task.updated_at >= stuck_after,
            // claim without task: the claimant died between the two writes
            (None, Some(row)) => now - row.claimed_at >= stuck_after,
            (None, None) => false,
        };
        if !stale {
            return Ok(false);
        }
        if let Some(task) = &task {
            if !tasks.delete_if_unchanged(task)? {
                return Ok(false);
            }
        }
        if let Some(row) = &holder {
            self.claims.release_if_unchanged(row)?;
        }
        warn!(
            target: "cohort::shared",
            key = %key,
            previous_status = task.as_ref().map(|t| t.status.as_str()).unwrap_or("missing"),
            previous_owner = holder.as_ref().map(|r| r.owner.as_str()).unwrap_or("none"),
            "reclaiming stale shared ritual"
        );
        self.journal.record(
            cohort_topics::TOPIC_CLAIM_RECLAIMED,
            ctx.occurrence_id().as_str(),
            now,
            &json!({
                "corr_id": key.as_str(),
                "previous_status": task.as_ref().map(|t| t.status),
                "previous_owner": holder.as_ref().map(|r| r.owner.clone()),
            }),
        );
        Ok(true)
    }

    /// Most recent ritual task of `kind` created within `within` of now.
    pub fn latest_shared_task(
        &self,
        kind: &str,
        within: Duration,
        ctx: &OccurrenceContext,
    ) -> Result<Option<Task>> {
        let since: DateTime<Utc> = ctx
            .now()
            .checked_sub_signed(chrono_span(within))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(self
            .kernel
            .tasks()
            .latest_with_prefix(&key_prefix(kind), since)?)
    }

    pub fn shared_task_status(
        &self,
        kind: &str,
        within: Duration,
        ctx: &OccurrenceContext,
    ) -> Result<Option<TaskStatus>> {
        Ok(self.latest_shared_task(kind, within, ctx)?.map(|t| t.status))
    }

    pub fn is_shared_task_completed(
        &self,
        kind: &str,
        within: Duration,
        ctx: &OccurrenceContext,
    ) -> Result<bool> {
        Ok(self.shared_task_status(kind, within, ctx)? == Some(TaskStatus::Completed))
    }

    /// Mark the ritual as still being worked on.
    pub fn keep_alive(&self, task_id: &str, ctx: &OccurrenceContext) -> Result<bool> {
        Ok(self.kernel.tasks().touch(task_id, ctx.now())?)
    }

    /// PENDING -> ACTIVE for the ritual the caller holds.
    pub fn start(&self, task_id: &str, ctx: &OccurrenceContext) -> Result<Task> {
        Ok(self
            .kernel
            .tasks()
            .set_status(task_id, TaskStatus::Active, None, None, ctx.now())?)
    }

    /// Drive the ritual to COMPLETED or FAILED, passing through ACTIVE if needed.
    pub fn finish(
        &self,
        task_id: &str,
        success: bool,
        notes: Option<&str>,
        ctx: &OccurrenceContext,
    ) -> Result<Task> {
        let tasks = self.kernel.tasks();
        let target = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        if success {
            if let Some(task) = tasks.get(task_id)? {
                if task.status == TaskStatus::Pending {
                    tasks.set_status(task_id, TaskStatus::Active, None, None, ctx.now())?;
                }
            }
        }
        Ok(tasks.set_status(task_id, target, None, notes, ctx.now())?)
    }

    /// Poll today's ritual of `kind` until it reaches a terminal status or the
    /// configured wait elapses. Dropping the future cancels the wait.
    pub async fn wait_for_shared_task(
        &self,
        kind: &str,
        ctx: &OccurrenceContext,
    ) -> Result<SharedTaskWait> {
        let key = self.key_for(kind, ctx);
        let poll = self.poll_until_terminal(&key);
        match tokio::time::timeout(self.options.wait_timeout, poll).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    target: "cohort::shared",
                    key = %key,
                    waited_secs = self.options.wait_timeout.as_secs(),
                    "gave up waiting for shared task"
                );
                Ok(SharedTaskWait::TimedOut)
            }
        }
    }

    async fn poll_until_terminal(&self, key: &ClaimKey) -> Result<SharedTaskWait> {
        let mut ticker = tokio::time::interval(self.options.poll_interval.max(MIN_POLL));
        loop {
            ticker.tick().await;
            let id = key.to_string();
            let task = self.kernel.blocking(move |k| k.tasks().get(&id)).await?;
            match task {
                Some(task) if task.status == TaskStatus::Completed => {
                    return Ok(SharedTaskWait::Completed(task))
                }
                Some(task) if task.status == TaskStatus::Failed => {
                    return Ok(SharedTaskWait::Failed(task))
                }
                _ => debug!(target: "cohort::shared", key = %key, "shared task not finished yet"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::test_support::{ctx, noon, store};
    use cohort_events::Bus;
    use std::sync::Arc;

    fn shared(kernel: &Kernel) -> SharedTasks {
        let journal = Journal::new(kernel.clone(), Bus::default());
        let claims = ClaimCoordinator::new(kernel.clone(), journal.clone());
        SharedTasks::new(kernel.clone(), claims, journal, SharedTaskOptions::default())
    }

    #[test]
    fn one_occurrence_creates_the_ritual_others_see_it() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let rituals = shared(&kernel);

        let first = rituals
            .claim_shared_task("wakeup", "wake the agent", 5, &ctx("occ-1", &clock))
            .unwrap();
        assert!(first.created());
        let task = first.task().unwrap();
        assert_eq!(task.task_id, "WAKEUP_SHARED_20251107");
        assert_eq!(task.owner, Owner::Shared);
        assert_eq!(task.priority, 5);

        let second = rituals
            .claim_shared_task("wakeup", "wake the agent", 5, &ctx("occ-2", &clock))
            .unwrap();
        match second {
            SharedClaim::HeldElsewhere { owner, task } => {
                assert_eq!(owner.as_str(), "occ-1");
                assert!(task.is_some());
            }
            other => panic!("expected HeldElsewhere, got {other:?}"),
        }

        let again = rituals
            .claim_shared_task("wakeup", "wake the agent", 5, &ctx("occ-1", &clock))
            .unwrap();
        assert!(matches!(again, SharedClaim::Resumed(_)));
    }

    #[test]
    fn fresh_pending_ritual_is_reused_until_stuck() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let rituals = shared(&kernel);
        rituals
            .claim_shared_task("wakeup", "", 0, &ctx("occ-1", &clock))
            .unwrap();

        clock.advance(chrono::Duration::minutes(9));
        let early = rituals
            .claim_shared_task("wakeup", "", 0, &ctx("occ-2", &clock))
            .unwrap();
        assert!(!early.is_ours());

        clock.advance(chrono::Duration::minutes(2));
        let late = rituals
            .claim_shared_task("wakeup", "", 0, &ctx("occ-2", &clock))
            .unwrap();
        assert!(late.created());
        assert_eq!(late.task().unwrap().created_at, clock.now());
    }

    #[test]
    fn finished_ritual_is_replaced_and_reported() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let rituals = shared(&kernel);
        let me = ctx("occ-1", &clock);
        let claim = rituals.claim_shared_task("shutdown", "", 0, &me).unwrap();
        let id = claim.task().unwrap().task_id.clone();
        rituals.finish(&id, true, Some("ok"), &me).unwrap();

        let window = Duration::from_secs(3600);
        assert!(rituals.is_shared_task_completed("shutdown", window, &me).unwrap());
        assert!(!rituals.is_shared_task_completed("wakeup", window, &me).unwrap());

        clock.advance(chrono::Duration::seconds(5));
        let next = rituals
            .claim_shared_task("shutdown", "", 0, &ctx("occ-2", &clock))
            .unwrap();
        assert!(next.created());
        assert_eq!(
            rituals.shared_task_status("shutdown", window, &me).unwrap(),
            Some(TaskStatus::Pending)
        );
        let events = kernel.events_for_corr(&id).unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind == cohort_topics::TOPIC_CLAIM_RECLAIMED));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_sees_completion_or_times_out() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let rituals = shared(&kernel);
        let leader = ctx("occ-1", &clock);
        let follower = ctx("occ-2", &clock);

        let claim = rituals.claim_shared_task("wakeup", "", 0, &leader).unwrap();
        let timed_out = rituals.wait_for_shared_task("wakeup", &follower).await.unwrap();
        assert_eq!(timed_out, SharedTaskWait::TimedOut);

        let id = claim.task().unwrap().task_id.clone();
        rituals.finish(&id, false, Some("crashed"), &leader).unwrap();
        match rituals.wait_for_shared_task("wakeup", &follower).await.unwrap() {
            SharedTaskWait::Failed(task) => assert_eq!(task.notes.as_deref(), Some("crashed")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_still_waits() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let journal = Journal::new(kernel.clone(), Bus::default());
        let claims = ClaimCoordinator::new(kernel.clone(), journal.clone());
        let options = SharedTaskOptions {
            poll_interval: Duration::ZERO,
            wait_timeout: Duration::from_millis(50),
            ..SharedTaskOptions::default()
        };
        let rituals = SharedTasks::new(kernel.clone(), claims, journal, options);

        rituals
            .claim_shared_task("wakeup", "", 0, &ctx("occ-1", &clock))
            .unwrap();
        let waited = rituals
            .wait_for_shared_task("wakeup", &ctx("occ-2", &clock))
            .await
            .unwrap();
        assert_eq!(waited, SharedTaskWait::TimedOut);
    }
}
