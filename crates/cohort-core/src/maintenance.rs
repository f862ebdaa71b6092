use std::time::Duration;

use cohort_kernel::{Kernel, KernelError, Task, TaskStatus};
use serde_json::json;
use tracing::{debug, warn};

use crate::context::OccurrenceContext;
use crate::error::Result;
use crate::journal::Journal;

/// Fails ACTIVE tasks the caller owns that have not moved for
/// `resume_stuck_after`, so the next discovery round can regenerate work.
#[derive(Clone)]
pub struct StaleTaskReaper {
    kernel: Kernel,
    journal: Journal,
    resume_stuck_after: Duration,
}

impl StaleTaskReaper {
    pub fn new(kernel: Kernel, journal: Journal, resume_stuck_after: Duration) -> Self {
        Self {
            kernel,
            journal,
            resume_stuck_after,
        }
    }

    pub fn reap(&self, ctx: &OccurrenceContext) -> Result<Vec<Task>> {
        let now = ctx.now();
        let span = chrono::Duration::from_std(self.resume_stuck_after)
            .unwrap_or(chrono::Duration::MAX);
        let tasks = self.kernel.tasks();
        let before = now.checked_sub_signed(span).unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let stale = tasks.stale_active(&ctx.owner(), before)?;
        let mut reaped = Vec::with_capacity(stale.len());
        for task in stale {
            let notes = format!(
                "no progress since {}; failed by stale task reaper",
                cohort_kernel::format_ts(task.updated_at)
            );
            match tasks.set_status(&task.task_id, TaskStatus::Failed, None, Some(&notes), now) {
                Ok(failed) => {
                    warn!(
                        target: "cohort::maintenance",
                        task = %failed.task_id,
                        correlation = ?failed.correlation_id,
                        "reaped stuck task"
                    );
                    self.journal.record(
                        cohort_topics::TOPIC_TASK_REAPED,
                        ctx.occurrence_id().as_str(),
                        now,
                        &json!({ "corr_id": failed.correlation_id, "task_id": failed.task_id }),
                    );
                    reaped.push(failed);
                }
                // Finished between the query and the update.
                Err(KernelError::InvalidTransition { .. }) => {
                    debug!(target: "cohort::maintenance", task = %task.task_id, "task finished before reaping");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(reaped)
    }

    pub async fn reap_async(&self, ctx: &OccurrenceContext) -> Result<Vec<Task>> {
        let this = self.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || this.reap(&ctx))
            .await
            .map_err(|e| KernelError::Join(e.to_string()))?
    }
}
