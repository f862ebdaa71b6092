//! Multi-occurrence coordination over a shared store.
//!
//! Occurrences never talk to each other directly: every decision is a
//! conditional write to the store followed by a read of what won.

mod config;
pub use config::{
    config_schema_json, load_config, parse_config, write_schema_file, CanaryConfig, Config,
    CoordinationConfig, OccurrenceConfig, StoreConfig,
};

pub mod canary;
pub mod claim;
pub mod clock;
pub mod context;
pub mod discovery;
mod error;
pub mod journal;
pub mod maintenance;
pub mod membership;
pub mod shared;
pub mod util;

#[cfg(test)]
mod test_support;

pub use canary::{
    partition, CanaryOptions, CanaryRolloutCoordinator, CanaryWave, HealthCheck, RolloutHandle,
    RolloutRole, RolloutState, WaveGate, WaveName,
};
pub use claim::{ClaimCoordinator, ClaimKey, ClaimOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::OccurrenceContext;
pub use discovery::{
    DiscoveryOptions, RoundReport, StateDrivenDiscoveryEngine, TaskProcessor, UnitOutcome,
};
pub use error::{CoordinationError, Result};
pub use journal::Journal;
pub use maintenance::StaleTaskReaper;
pub use membership::{MembershipSource, OccurrenceDiscovery};
pub use shared::{SharedClaim, SharedTaskOptions, SharedTaskWait, SharedTasks};

use chrono::{DateTime, Utc};
use cohort_events::Bus;
use cohort_kernel::{
    Kernel, MetadataPatch, NewTicket, OccurrenceId, Task, TaskStatus, Ticket, TicketStatus,
};
use serde_json::json;
use tracing::info;

/// Every coordinator for one occurrence, wired to one store and one bus.
#[derive(Clone)]
pub struct Coordination {
    pub kernel: Kernel,
    pub journal: Journal,
    pub claims: ClaimCoordinator,
    pub shared: SharedTasks,
    pub discovery: StateDrivenDiscoveryEngine,
    pub membership: OccurrenceDiscovery,
    pub canary: CanaryRolloutCoordinator,
    pub reaper: StaleTaskReaper,
}

impl Coordination {
    pub fn new(kernel: Kernel, bus: Bus, cfg: &Config) -> Result<Self> {
        let source = match &cfg.occurrence.members {
            Some(list) => MembershipSource::Static(
                list.iter()
                    .map(|m| OccurrenceId::new(m.as_str()))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| CoordinationError::Config(e.to_string()))?,
            ),
            None => MembershipSource::Liveness {
                window: cfg.liveness_window(),
            },
        };
        let shared_opts = cfg.shared_task_options();
        let journal = Journal::new(kernel.clone(), bus);
        let claims = ClaimCoordinator::new(kernel.clone(), journal.clone());
        let shared = SharedTasks::new(
            kernel.clone(),
            claims.clone(),
            journal.clone(),
            shared_opts.clone(),
        );
        let membership = OccurrenceDiscovery::new(kernel.clone(), journal.clone(), source);
        let discovery =
            StateDrivenDiscoveryEngine::new(kernel.clone(), claims.clone(), journal.clone());
        let canary = CanaryRolloutCoordinator::new(
            kernel.clone(),
            shared.clone(),
            membership.clone(),
            journal.clone(),
            cfg.canary_options(),
        );
        let reaper = StaleTaskReaper::new(
            kernel.clone(),
            journal.clone(),
            shared_opts.resume_stuck_after,
        );
        Ok(Self {
            kernel,
            journal,
            claims,
            shared,
            discovery,
            membership,
            canary,
            reaper,
        })
    }
}

/// Operator-facing writes. Each one goes through the registries' single
/// status path and leaves an entry in the journal.
impl Coordination {
    /// Submit a ticket. It starts PENDING and owned by the shared sentinel.
    pub async fn submit_ticket(&self, ticket: NewTicket, ctx: &OccurrenceContext) -> Result<Ticket> {
        let now = ctx.now();
        let created = self
            .kernel
            .blocking(move |k| k.tickets().create(&ticket, now))
            .await?;
        info!(
            target: "cohort::tickets",
            ticket = %created.ticket_id,
            kind = %created.kind,
            priority = created.priority,
            "ticket submitted"
        );
        self.journal
            .record_async(
                cohort_topics::TOPIC_TICKET_SUBMITTED,
                ctx.occurrence_id().as_str(),
                now,
                &json!({
                    "corr_id": created.ticket_id,
                    "kind": created.kind,
                    "priority": created.priority,
                }),
            )
            .await;
        Ok(created)
    }

    /// Move a ticket along its lifecycle. The owner is kept.
    pub async fn transition_ticket(
        &self,
        ticket_id: &str,
        status: TicketStatus,
        notes: Option<String>,
        ctx: &OccurrenceContext,
    ) -> Result<Ticket> {
        let id = ticket_id.to_string();
        let now = ctx.now();
        let ticket = self
            .kernel
            .blocking(move |k| k.tickets().set_status(&id, status, None, notes.as_deref(), now))
            .await?;
        info!(
            target: "cohort::tickets",
            ticket = %ticket.ticket_id,
            status = %ticket.status,
            owner = %ticket.owner,
            "ticket status changed"
        );
        self.journal
            .record_async(
                cohort_topics::TOPIC_TICKET_STATUS_CHANGED,
                ctx.occurrence_id().as_str(),
                now,
                &json!({
                    "corr_id": ticket.ticket_id,
                    "status": ticket.status,
                    "owner": ticket.owner,
                    "notes": ticket.notes,
                }),
            )
            .await;
        Ok(ticket)
    }

    /// Set or clear the ticket's `deferred_until`.
    pub async fn defer_ticket(
        &self,
        ticket_id: &str,
        until: Option<DateTime<Utc>>,
        ctx: &OccurrenceContext,
    ) -> Result<Ticket> {
        let id = ticket_id.to_string();
        let now = ctx.now();
        let patch = MetadataPatch::default().defer_until(until);
        Ok(self
            .kernel
            .blocking(move |k| k.tickets().update_metadata(&id, patch, now))
            .await?)
    }

    /// Close an ACTIVE task as COMPLETED or FAILED.
    pub async fn complete_task(
        &self,
        task_id: &str,
        success: bool,
        notes: Option<String>,
        ctx: &OccurrenceContext,
    ) -> Result<Task> {
        let id = task_id.to_string();
        let now = ctx.now();
        let status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let task = self
            .kernel
            .blocking(move |k| k.tasks().set_status(&id, status, None, notes.as_deref(), now))
            .await?;
        info!(target: "cohort::tasks", task = %task.task_id, status = %task.status, "task closed");
        self.journal
            .record_async(
                cohort_topics::TOPIC_TASK_STATUS_CHANGED,
                ctx.occurrence_id().as_str(),
                now,
                &json!({
                    "corr_id": task.correlation_id,
                    "task_id": task.task_id,
                    "status": task.status,
                }),
            )
            .await;
        Ok(task)
    }
}
