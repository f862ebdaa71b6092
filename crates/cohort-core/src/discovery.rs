//! Per-round scan that turns ticket state into tasks.
//!
//! Phase 1 claims shared PENDING tickets; phase 2 regenerates continuation
//! tasks for tickets the caller already owns. Every decision re-reads the
//! store, and a failure on one ticket is logged and skipped without touching
//! the rest of the round.

use std::sync::Arc;

use async_trait::async_trait;
use cohort_kernel::{
    Kernel, KernelError, NewTask, Owner, Task, TaskSource, TaskStatus, Ticket,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::claim::{ClaimCoordinator, ClaimKey};
use crate::context::OccurrenceContext;
use crate::error::Result;
use crate::journal::Journal;

/// Downstream consumer of the tasks a round creates. Completion comes back
/// through `TaskRegistry::set_status`.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn accept(&self, task: &Task) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
pub struct DiscoveryOptions {
    /// Upper bound on tickets examined per phase per round.
    pub batch_limit: i64,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self { batch_limit: 100 }
    }
}

/// What happened to one ticket during a round.
#[derive(Clone, Debug, PartialEq)]
pub enum UnitOutcome {
    Created(Task),
    /// Another occurrence won the claim.
    LostClaim,
    /// An ACTIVE task already covers the ticket.
    AlreadyActive,
    /// Deferred into the future or waiting on a human.
    Paused,
    /// The ticket changed state between the query and the decision.
    Stale,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    pub claimed: usize,
    pub continued: usize,
    pub lost_claims: usize,
    pub already_active: usize,
    pub paused: usize,
    pub stale: usize,
    pub failures: usize,
}

impl RoundReport {
    pub fn tasks_created(&self) -> usize {
        self.claimed + self.continued
    }

    fn tally(&mut self, phase: Phase, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Created(_) => match phase {
                Phase::Claim => self.claimed += 1,
                Phase::Continue => self.continued += 1,
            },
            UnitOutcome::LostClaim => self.lost_claims += 1,
            UnitOutcome::AlreadyActive => self.already_active += 1,
            UnitOutcome::Paused => self.paused += 1,
            UnitOutcome::Stale => self.stale += 1,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Claim,
    Continue,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Claim => "claim",
            Phase::Continue => "continuation",
        }
    }
}

fn ticket_task_id(ticket_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("TICKET-{}-{}", ticket_id, &suffix[..8])
}

fn task_for(ticket: &Ticket, owner: Owner, source: TaskSource) -> NewTask {
    NewTask::new(ticket_task_id(&ticket.ticket_id), owner, source)
        .status(TaskStatus::Active)
        .priority(ticket.priority)
        .correlation(ticket.ticket_id.clone())
        .description(format!("{} ticket {}", ticket.kind, ticket.ticket_id))
        .context(json!({
            "ticket_id": ticket.ticket_id,
            "kind": ticket.kind,
            "phase": source.as_str(),
            "stages": ticket.metadata.stages,
        }))
}

/// A recoverable "someone else moved first" condition rather than a failure.
fn lost_race(err: &KernelError) -> bool {
    matches!(
        err,
        KernelError::Conflict { .. }
            | KernelError::InvalidTransition { .. }
            | KernelError::InvalidOwner { .. }
    )
}

#[derive(Clone)]
pub struct StateDrivenDiscoveryEngine {
    kernel: Kernel,
    claims: ClaimCoordinator,
    journal: Journal,
    processor: Option<Arc<dyn TaskProcessor>>,
    options: DiscoveryOptions,
}

impl StateDrivenDiscoveryEngine {
    pub fn new(kernel: Kernel, claims: ClaimCoordinator, journal: Journal) -> Self {
        Self {
            kernel,
            claims,
            journal,
            processor: None,
            options: DiscoveryOptions::default(),
        }
    }

    pub fn with_processor(mut self, processor: Arc<dyn TaskProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_options(mut self, options: DiscoveryOptions) -> Self {
        self.options = options;
        self
    }

    /// Run one round for the calling occurrence; returns tasks created.
    pub async fn run_round(&self, ctx: &OccurrenceContext) -> usize {
        self.run_round_report(ctx).await.tasks_created()
    }

    pub async fn run_round_report(&self, ctx: &OccurrenceContext) -> RoundReport {
        let mut report = RoundReport::default();
        let me = ctx.occurrence_id().clone();

        let touch = {
            let me = me.clone();
            let now = ctx.now();
            self.kernel
                .blocking(move |k| k.touch_occurrence(&me, now))
                .await
        };
        if let Err(err) = touch {
            warn!(target: "cohort::discovery", occurrence = %me, error = %err, "heartbeat write failed");
        }

        // Phase 1: shared pending tickets.
        let limit = self.options.batch_limit;
        let pending = self
            .kernel
            .blocking(move |k| k.tickets().shared_pending(limit))
            .await;
        match pending {
            Ok(tickets) => {
                for ticket in tickets {
                    self.process_unit(Phase::Claim, ticket, ctx, &mut report)
                        .await;
                }
            }
            Err(err) => {
                report.failures += 1;
                warn!(target: "cohort::discovery", occurrence = %me, error = %err, "listing shared tickets failed");
            }
        }

        // Phase 2: tickets this occurrence already drives.
        let owned = {
            let me = me.clone();
            self.kernel
                .blocking(move |k| k.tickets().owned_active(&me, limit))
                .await
        };
        match owned {
            Ok(tickets) => {
                for ticket in tickets {
                    self.process_unit(Phase::Continue, ticket, ctx, &mut report)
                        .await;
                }
            }
            Err(err) => {
                report.failures += 1;
                warn!(target: "cohort::discovery", occurrence = %me, error = %err, "listing owned tickets failed");
            }
        }

        let created = report.tasks_created();
        if created == 0 && report.failures == 0 {
            debug!(target: "cohort::discovery", occurrence = %me, ?report, "discovery round idle");
            return report;
        }
        if created > 0 {
            info!(
                target: "cohort::discovery",
                occurrence = %me,
                claimed = report.claimed,
                continued = report.continued,
                failures = report.failures,
                "discovery round created tasks"
            );
        }
        // Only rounds that did something are journaled.
        self.journal
            .record_async(
                cohort_topics::TOPIC_DISCOVERY_ROUND_COMPLETED,
                me.as_str(),
                ctx.now(),
                &report,
            )
            .await;
        report
    }

    async fn process_unit(
        &self,
        phase: Phase,
        ticket: Ticket,
        ctx: &OccurrenceContext,
        report: &mut RoundReport,
    ) {
        let ticket_id = ticket.ticket_id.clone();
        let this = self.clone();
        let unit_ctx = ctx.clone();
        let joined = tokio::task::spawn_blocking(move || match phase {
            Phase::Claim => this.claim_unit(&ticket, &unit_ctx),
            Phase::Continue => this.continue_unit(&ticket, &unit_ctx),
        })
        .await;
        let result = match joined {
            Ok(result) => result,
            Err(err) => Err(KernelError::Join(err.to_string()).into()),
        };

        match result {
            Ok(outcome) => {
                report.tally(phase, &outcome);
                if let UnitOutcome::Created(task) = outcome {
                    self.hand_off(&task).await;
                }
            }
            Err(err) => {
                report.failures += 1;
                warn!(
                    target: "cohort::discovery",
                    occurrence = %ctx.occurrence_id(),
                    ticket = %ticket_id,
                    phase = phase.as_str(),
                    error = %err,
                    "ticket skipped this round"
                );
                self.journal
                    .record_async(
                        cohort_topics::TOPIC_DISCOVERY_UNIT_FAILED,
                        ctx.occurrence_id().as_str(),
                        ctx.now(),
                        &json!({ "corr_id": ticket_id, "phase": phase.as_str(), "error": err.to_string() }),
                    )
                    .await;
            }
        }
    }

    async fn hand_off(&self, task: &Task) {
        let Some(processor) = &self.processor else {
            return;
        };
        if let Err(err) = processor.accept(task).await {
            warn!(
                target: "cohort::discovery",
                task = %task.task_id,
                error = %err,
                "processor rejected task"
            );
        }
    }

    /// Phase 1 for one ticket: claim, move PENDING -> ASSIGNED, seed a task.
    pub fn claim_unit(&self, ticket: &Ticket, ctx: &OccurrenceContext) -> Result<UnitOutcome> {
        let key = ClaimKey::ticket(&ticket.ticket_id);
        let outcome = self.claims.try_claim(&key, ctx)?;
        if !outcome.owned_by_caller() {
            debug!(
                target: "cohort::discovery",
                ticket = %ticket.ticket_id,
                owner = %outcome.owner(),
                "ticket claimed elsewhere"
            );
            return Ok(UnitOutcome::LostClaim);
        }
        let tickets = self.kernel.tickets();
        let assigned = match tickets.claim_pending(&ticket.ticket_id, ctx.occurrence_id(), ctx.now()) {
            Ok(t) => t,
            Err(err) if lost_race(&err) => {
                debug!(target: "cohort::discovery", ticket = %ticket.ticket_id, error = %err, "ticket no longer claimable");
                return Ok(UnitOutcome::Stale);
            }
            Err(err) => return Err(err.into()),
        };
        self.journal.record(
            cohort_topics::TOPIC_TICKET_CLAIMED,
            ctx.occurrence_id().as_str(),
            ctx.now(),
            &json!({ "corr_id": assigned.ticket_id, "owner": ctx.occurrence_id(), "kind": assigned.kind }),
        );
        self.create_task(&assigned, TaskSource::Claim, ctx)
    }

    /// Phase 2 for one ticket: continue work unless covered or paused.
    pub fn continue_unit(&self, ticket: &Ticket, ctx: &OccurrenceContext) -> Result<UnitOutcome> {
        let Some(current) = self.kernel.tickets().get(&ticket.ticket_id)? else {
            return Ok(UnitOutcome::Stale);
        };
        if current.owner != ctx.owner() || !current.status.is_workable() {
            return Ok(UnitOutcome::Stale);
        }
        if self
            .kernel
            .tasks()
            .active_for_correlation(&current.ticket_id)?
            .is_some()
        {
            return Ok(UnitOutcome::AlreadyActive);
        }
        if current.metadata.is_paused_at(ctx.now()) {
            debug!(
                target: "cohort::discovery",
                ticket = %current.ticket_id,
                deferred_until = ?current.metadata.deferred_until,
                awaiting_human = current.metadata.awaiting_human_response,
                "ticket paused"
            );
            return Ok(UnitOutcome::Paused);
        }
        self.create_task(&current, TaskSource::Continuation, ctx)
    }

    fn create_task(
        &self,
        ticket: &Ticket,
        source: TaskSource,
        ctx: &OccurrenceContext,
    ) -> Result<UnitOutcome> {
        let new = task_for(ticket, ctx.owner(), source);
        match self.kernel.tasks().insert(&new, ctx.now())? {
            Some(task) => {
                debug!(
                    target: "cohort::discovery",
                    ticket = %ticket.ticket_id,
                    task = %task.task_id,
                    source = source.as_str(),
                    "task created"
                );
                self.journal.record(
                    cohort_topics::TOPIC_TASK_CREATED,
                    ctx.occurrence_id().as_str(),
                    ctx.now(),
                    &json!({ "corr_id": ticket.ticket_id, "task_id": task.task_id, "source": source }),
                );
                Ok(UnitOutcome::Created(task))
            }
            None => Ok(UnitOutcome::AlreadyActive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_support::{ctx, noon, store};
    use cohort_events::Bus;
    use cohort_kernel::{MetadataPatch, NewTicket, TicketStatus};
    use std::sync::Mutex;

    fn engine(kernel: &Kernel) -> StateDrivenDiscoveryEngine {
        let journal = Journal::new(kernel.clone(), Bus::default());
        let claims = ClaimCoordinator::new(kernel.clone(), journal.clone());
        StateDrivenDiscoveryEngine::new(kernel.clone(), claims, journal)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl TaskProcessor for Recorder {
        async fn accept(&self, task: &Task) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(task.task_id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn claim_then_continue_never_doubles_up() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let recorder = Arc::new(Recorder::default());
        let engine = engine(&kernel).with_processor(recorder.clone());
        kernel
            .tickets()
            .create(&NewTicket::new("T1", "dsar").priority(3), noon())
            .unwrap();
        let me = ctx("occ-1", &clock);

        let report = engine.run_round_report(&me).await;
        assert_eq!(report.claimed, 1);
        assert_eq!(report.continued, 0);
        assert_eq!(report.already_active, 1, "phase 2 sees the fresh claim task");

        let tasks = kernel.tasks().by_correlation("T1").unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].task_id.starts_with("TICKET-T1-"));
        assert_eq!(tasks[0].task_id.len(), "TICKET-T1-".len() + 8);
        assert_eq!(tasks[0].source, TaskSource::Claim);
        assert_eq!(tasks[0].priority, 3);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);

        // Still ACTIVE: nothing new.
        assert_eq!(engine.run_round(&me).await, 0);

        // Processing finishes the task; the next round continues the ticket.
        kernel
            .tasks()
            .set_status(&tasks[0].task_id, TaskStatus::Completed, None, None, noon())
            .unwrap();
        assert_eq!(engine.run_round(&me).await, 1);
        let latest = kernel.tasks().active_for_correlation("T1").unwrap().unwrap();
        assert_eq!(latest.source, TaskSource::Continuation);
    }

    #[tokio::test]
    async fn awaiting_human_pauses_until_cleared() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let engine = engine(&kernel);
        let tickets = kernel.tickets();
        tickets.create(&NewTicket::new("T1", "dsar"), noon()).unwrap();
        tickets.claim_pending("T1", &crate::test_support::occ("occ-1"), noon()).unwrap();
        tickets
            .update_metadata("T1", MetadataPatch::default().awaiting_human(true), noon())
            .unwrap();

        let me = ctx("occ-1", &clock);
        let report = engine.run_round_report(&me).await;
        assert_eq!(report.paused, 1);
        assert_eq!(report.tasks_created(), 0);

        tickets
            .update_metadata("T1", MetadataPatch::default().awaiting_human(false), noon())
            .unwrap();
        assert_eq!(engine.run_round(&me).await, 1);
    }

    #[tokio::test]
    async fn claim_held_from_a_crashed_round_is_resumed() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let engine = engine(&kernel);
        kernel
            .tickets()
            .create(&NewTicket::new("T1", "dsar"), noon())
            .unwrap();
        // The claim row landed but the ticket update never happened.
        kernel
            .claims()
            .insert_if_absent("ticket:T1", &crate::test_support::occ("occ-1"), noon())
            .unwrap();

        assert_eq!(engine.run_round(&ctx("occ-2", &clock)).await, 0);
        assert_eq!(engine.run_round(&ctx("occ-1", &clock)).await, 1);
        let ticket = kernel.tickets().get("T1").unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Assigned);
        assert_eq!(ticket.owner.as_str(), "occ-1");
    }
}
