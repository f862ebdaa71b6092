//! Wave-gated rollouts.
//!
//! Membership is sorted and cut into explorer (1), early_adopter
//! (ceil(p% of the rest)) and general (the remainder). The occurrence that
//! wins today's ritual claim for the rollout kind leads: it releases the
//! explorer wave, then a background task waits out a grace period and polls a
//! caller-supplied health check before releasing each following wave.
//!
//! Releasing a wave writes a shared unit (`ROLLOUT-<id>-<wave>`) straight to
//! COMPLETED; followers learn that their wave may act by seeing that unit in a
//! terminal state on their next poll. A health timeout moves the rollout to
//! ABORTED and nothing further is released. Nothing already released is
//! rolled back.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cohort_kernel::{
    Kernel, NewTask, OccurrenceId, Owner, RolloutRecord, TaskSource, TaskStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::OccurrenceContext;
use crate::error::{CoordinationError, Result};
use crate::journal::Journal;
use crate::membership::OccurrenceDiscovery;
use crate::shared::{SharedClaim, SharedTasks};

/// Floor for polling periods; `tokio::time::interval` rejects zero.
const MIN_POLL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveName {
    Explorer,
    EarlyAdopter,
    General,
}

impl WaveName {
    pub const ALL: [WaveName; 3] = [WaveName::Explorer, WaveName::EarlyAdopter, WaveName::General];

    pub fn as_str(&self) -> &'static str {
        match self {
            WaveName::Explorer => "explorer",
            WaveName::EarlyAdopter => "early_adopter",
            WaveName::General => "general",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.as_str() == value.trim())
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn next(&self) -> Option<WaveName> {
        Self::ALL.get(self.index() + 1).copied()
    }
}

impl fmt::Display for WaveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryWave {
    pub name: WaveName,
    pub members: Vec<OccurrenceId>,
}

/// Deterministic split of `members` into the three waves. The same set always
/// yields the same waves; all three are returned even when empty.
pub fn partition(members: &BTreeSet<OccurrenceId>, early_adopter_percent: u32) -> Vec<CanaryWave> {
    let sorted: Vec<OccurrenceId> = members.iter().cloned().collect();
    let explorer_len = sorted.len().min(1);
    let rest = sorted.len() - explorer_len;
    let pct = early_adopter_percent.min(100) as usize;
    let early_len = ((rest * pct + 99) / 100).min(rest);

    let (explorer, tail) = sorted.split_at(explorer_len);
    let (early, general) = tail.split_at(early_len);
    vec![
        CanaryWave {
            name: WaveName::Explorer,
            members: explorer.to_vec(),
        },
        CanaryWave {
            name: WaveName::EarlyAdopter,
            members: early.to_vec(),
        },
        CanaryWave {
            name: WaveName::General,
            members: general.to_vec(),
        },
    ]
}

pub fn wave_of(waves: &[CanaryWave], occurrence: &OccurrenceId) -> Option<WaveName> {
    waves
        .iter()
        .find(|w| w.members.contains(occurrence))
        .map(|w| w.name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    NotStarted,
    WaveExplorer,
    WaveEarlyAdopter,
    WaveGeneral,
    Done,
    Aborted,
}

impl RolloutState {
    pub const ALL: [RolloutState; 6] = [
        RolloutState::NotStarted,
        RolloutState::WaveExplorer,
        RolloutState::WaveEarlyAdopter,
        RolloutState::WaveGeneral,
        RolloutState::Done,
        RolloutState::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutState::NotStarted => "not_started",
            RolloutState::WaveExplorer => "wave_explorer",
            RolloutState::WaveEarlyAdopter => "wave_early_adopter",
            RolloutState::WaveGeneral => "wave_general",
            RolloutState::Done => "done",
            RolloutState::Aborted => "aborted",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|s| s.as_str() == normalized)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutState::Done | RolloutState::Aborted)
    }

    pub fn for_wave(wave: WaveName) -> Self {
        match wave {
            WaveName::Explorer => RolloutState::WaveExplorer,
            WaveName::EarlyAdopter => RolloutState::WaveEarlyAdopter,
            WaveName::General => RolloutState::WaveGeneral,
        }
    }

    pub fn wave(&self) -> Option<WaveName> {
        match self {
            RolloutState::WaveExplorer => Some(WaveName::Explorer),
            RolloutState::WaveEarlyAdopter => Some(WaveName::EarlyAdopter),
            RolloutState::WaveGeneral => Some(WaveName::General),
            _ => None,
        }
    }

    /// Valid next states.
    pub const fn next(&self) -> &'static [RolloutState] {
        match self {
            RolloutState::NotStarted => &[RolloutState::WaveExplorer],
            RolloutState::WaveExplorer => &[RolloutState::WaveEarlyAdopter, RolloutState::Aborted],
            RolloutState::WaveEarlyAdopter => &[RolloutState::WaveGeneral, RolloutState::Aborted],
            RolloutState::WaveGeneral => &[RolloutState::Done, RolloutState::Aborted],
            RolloutState::Done | RolloutState::Aborted => &[],
        }
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kind health predicate. The coordinator knows nothing about what
/// healthy means for the action being rolled out.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn healthy(&self, wave: &CanaryWave) -> bool;
}

#[async_trait]
impl<F> HealthCheck for F
where
    F: Fn(&CanaryWave) -> bool + Send + Sync,
{
    async fn healthy(&self, wave: &CanaryWave) -> bool {
        self(wave)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanaryOptions {
    pub early_adopter_percent: u32,
    pub grace: Duration,
    pub health_timeout: Duration,
    pub health_poll: Duration,
}

impl Default for CanaryOptions {
    fn default() -> Self {
        Self {
            early_adopter_percent: 30,
            grace: Duration::from_secs(15),
            health_timeout: Duration::from_secs(300),
            health_poll: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolloutRole {
    Leader,
    Follower { leader: OccurrenceId },
}

pub struct RolloutHandle {
    rollout_id: String,
    kind: String,
    role: RolloutRole,
    waves: Vec<CanaryWave>,
    cancel: CancellationToken,
    task: Option<JoinHandle<RolloutState>>,
}

impl RolloutHandle {
    pub fn rollout_id(&self) -> &str {
        &self.rollout_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn role(&self) -> &RolloutRole {
        &self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == RolloutRole::Leader
    }

    pub fn waves(&self) -> &[CanaryWave] {
        &self.waves
    }

    /// Stop the health loop; the rollout ends ABORTED. No effect on followers.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Token that aborts the rollout when cancelled, for use while `join` holds the handle.
    pub fn abort_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the leader's background task to finish. `None` for followers
    /// or when already joined.
    pub async fn join(&mut self) -> Option<RolloutState> {
        let task = self.task.take()?;
        match task.await {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(target: "cohort::canary", rollout = %self.rollout_id, error = %err, "rollout task ended abnormally");
                Some(RolloutState::Aborted)
            }
        }
    }
}

/// What a follower learns from [`CanaryRolloutCoordinator::wave_gate`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WaveGate {
    pub rollout_id: String,
    pub wave: Option<WaveName>,
    pub state: RolloutState,
    /// The caller's wave unit is terminal; it may perform the action.
    pub released: bool,
}

fn wave_unit_id(rollout_id: &str, wave: WaveName) -> String {
    format!("ROLLOUT-{rollout_id}-{}", wave.as_str())
}

#[derive(Clone)]
pub struct CanaryRolloutCoordinator {
    kernel: Kernel,
    shared: SharedTasks,
    membership: OccurrenceDiscovery,
    journal: Journal,
    options: CanaryOptions,
}

impl CanaryRolloutCoordinator {
    pub fn new(
        kernel: Kernel,
        shared: SharedTasks,
        membership: OccurrenceDiscovery,
        journal: Journal,
        options: CanaryOptions,
    ) -> Self {
        Self {
            kernel,
            shared,
            membership,
            journal,
            options,
        }
    }

    pub fn options(&self) -> &CanaryOptions {
        &self.options
    }

    /// Current waves as seen by `ctx`.
    pub async fn waves(&self, ctx: &OccurrenceContext) -> Vec<CanaryWave> {
        let members = self.membership.discover_async(ctx).await;
        partition(&members, self.options.early_adopter_percent)
    }

    /// Start (or join) today's rollout of `kind`. The claim winner becomes
    /// leader and drives the waves from a background task; everyone else gets
    /// a follower handle and should poll [`Self::wave_gate`].
    pub async fn start_rollout(
        &self,
        kind: &str,
        ctx: &OccurrenceContext,
        health: Arc<dyn HealthCheck>,
    ) -> Result<RolloutHandle> {
        let rollout_id = self.shared.key_for(kind, ctx).to_string();
        if let Some(done) = self.finished_record(&rollout_id).await? {
            debug!(target: "cohort::canary", rollout = %rollout_id, state = %done.state, "rollout already finished today");
            let leader = OccurrenceId::new(done.initiator.as_str())
                .unwrap_or_else(|_| ctx.occurrence_id().clone());
            return Ok(RolloutHandle {
                rollout_id,
                kind: kind.to_string(),
                role: RolloutRole::Follower { leader },
                waves: self.waves(ctx).await,
                cancel: CancellationToken::new(),
                task: None,
            });
        }

        let claim = {
            let shared = self.shared.clone();
            let kind = kind.to_string();
            let task_ctx = ctx.clone();
            tokio::task::spawn_blocking(move || {
                shared.claim_shared_task(&kind, &format!("{kind} rollout"), 0, &task_ctx)
            })
            .await
            .map_err(|e| CoordinationError::Persistence(cohort_kernel::KernelError::Join(e.to_string())))??
        };
        let waves = self.waves(ctx).await;

        if let SharedClaim::HeldElsewhere { owner, .. } = &claim {
            debug!(target: "cohort::canary", rollout = %rollout_id, leader = %owner, "following rollout");
            return Ok(RolloutHandle {
                rollout_id,
                kind: kind.to_string(),
                role: RolloutRole::Follower {
                    leader: owner.clone(),
                },
                waves,
                cancel: CancellationToken::new(),
                task: None,
            });
        }

        let existing = self.load_record(&rollout_id).await?;
        let resume_from = existing
            .as_ref()
            .and_then(|r| RolloutState::from_slug(&r.state))
            .and_then(|s| s.wave());

        let run = RolloutRun {
            kernel: self.kernel.clone(),
            shared: self.shared.clone(),
            journal: self.journal.clone(),
            options: self.options.clone(),
            health,
            ctx: ctx.clone(),
            rollout_id: rollout_id.clone(),
            kind: kind.to_string(),
            started_at: existing.as_ref().map(|r| r.created_at).unwrap_or_else(|| ctx.now()),
            waves: waves.clone(),
        };

        let start_wave = match resume_from {
            Some(wave) => {
                info!(target: "cohort::canary", rollout = %rollout_id, wave = %wave, "resuming rollout");
                wave
            }
            None => {
                run.shared_start().await;
                info!(
                    target: "cohort::canary",
                    rollout = %rollout_id,
                    explorer = waves[0].members.len(),
                    early_adopter = waves[1].members.len(),
                    general = waves[2].members.len(),
                    "rollout started"
                );
                run.journal
                    .record_async(
                        cohort_topics::TOPIC_ROLLOUT_STARTED,
                        ctx.occurrence_id().as_str(),
                        ctx.now(),
                        &json!({ "corr_id": rollout_id, "kind": kind, "waves": waves }),
                    )
                    .await;
                run.release(WaveName::Explorer).await;
                WaveName::Explorer
            }
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run.supervise(start_wave, cancel.clone()));
        Ok(RolloutHandle {
            rollout_id,
            kind: kind.to_string(),
            role: RolloutRole::Leader,
            waves,
            cancel,
            task: Some(task),
        })
    }

    /// Persisted state of the rollout behind `handle`.
    pub async fn get_rollout_status(&self, handle: &RolloutHandle) -> Result<RolloutState> {
        self.status_of(handle.rollout_id()).await
    }

    pub async fn status_of(&self, rollout_id: &str) -> Result<RolloutState> {
        Ok(self
            .load_record(rollout_id)
            .await?
            .and_then(|r| RolloutState::from_slug(&r.state))
            .unwrap_or(RolloutState::NotStarted))
    }

    pub async fn record(&self, rollout_id: &str) -> Result<Option<RolloutRecord>> {
        self.load_record(rollout_id).await
    }

    /// Whether the caller's wave of today's `kind` rollout has been released.
    pub async fn wave_gate(&self, kind: &str, ctx: &OccurrenceContext) -> Result<WaveGate> {
        let rollout_id = self.shared.key_for(kind, ctx).to_string();
        let state = self.status_of(&rollout_id).await?;
        let waves = self.waves(ctx).await;
        let wave = wave_of(&waves, ctx.occurrence_id());
        let released = match wave {
            Some(wave) => {
                let unit = wave_unit_id(&rollout_id, wave);
                let task = self.kernel.blocking(move |k| k.tasks().get(&unit)).await?;
                task.is_some_and(|t| t.status.is_terminal())
            }
            None => false,
        };
        Ok(WaveGate {
            rollout_id,
            wave,
            state,
            released,
        })
    }

    /// The record for `rollout_id` if it already reached DONE or ABORTED.
    /// A finished rollout is final for its day bucket.
    async fn finished_record(&self, rollout_id: &str) -> Result<Option<RolloutRecord>> {
        Ok(self.load_record(rollout_id).await?.filter(|r| {
            RolloutState::from_slug(&r.state).is_some_and(|s| s.is_terminal())
        }))
    }

    async fn load_record(&self, rollout_id: &str) -> Result<Option<RolloutRecord>> {
        let id = rollout_id.to_string();
        Ok(self.kernel.blocking(move |k| k.rollouts().get(&id)).await?)
    }
}

enum GateResult {
    Passed,
    TimedOut,
    Cancelled,
}

/// Everything the background task needs, detached from the coordinator.
#[derive(Clone)]
struct RolloutRun {
    kernel: Kernel,
    shared: SharedTasks,
    journal: Journal,
    options: CanaryOptions,
    health: Arc<dyn HealthCheck>,
    ctx: OccurrenceContext,
    rollout_id: String,
    kind: String,
    started_at: chrono::DateTime<chrono::Utc>,
    waves: Vec<CanaryWave>,
}

impl RolloutRun {
    /// Drive the waves in a child task. If that task dies, the rollout is
    /// still recorded ABORTED.
    async fn supervise(self, start: WaveName, cancel: CancellationToken) -> RolloutState {
        let driver = tokio::spawn(self.clone().drive(start, cancel));
        let err = match driver.await {
            Ok(state) => return state,
            Err(err) => err,
        };
        let current = self.current_state().await;
        if current.is_terminal() {
            return current;
        }
        let wave = current.wave().unwrap_or(start);
        self.abort(wave, format!("rollout task failed during {wave} wave: {err}"))
            .await
    }

    async fn current_state(&self) -> RolloutState {
        let id = self.rollout_id.clone();
        match self.kernel.blocking(move |k| k.rollouts().get(&id)).await {
            Ok(record) => record
                .and_then(|r| RolloutState::from_slug(&r.state))
                .unwrap_or(RolloutState::NotStarted),
            Err(err) => {
                warn!(target: "cohort::canary", rollout = %self.rollout_id, error = %err, "failed to read rollout state");
                RolloutState::NotStarted
            }
        }
    }

    async fn drive(self, start: WaveName, cancel: CancellationToken) -> RolloutState {
        let mut wave = start;
        loop {
            match self.gate(wave, &cancel).await {
                GateResult::Passed => {}
                GateResult::TimedOut => {
                    let reason = CoordinationError::RolloutHealthTimeout {
                        rollout_id: self.rollout_id.clone(),
                        wave: wave.to_string(),
                    }
                    .to_string();
                    return self.abort(wave, reason).await;
                }
                GateResult::Cancelled => {
                    let reason = format!("aborted by {} during {wave} wave", self.ctx.occurrence_id());
                    return self.abort(wave, reason).await;
                }
            }
            match wave.next() {
                Some(next) => {
                    self.release(next).await;
                    wave = next;
                }
                None => {
                    self.persist(RolloutState::Done, Some(wave), None).await;
                    self.shared_finish(true, "rollout complete").await;
                    info!(target: "cohort::canary", rollout = %self.rollout_id, "rollout done");
                    return RolloutState::Done;
                }
            }
        }
    }

    /// Grace period, then poll the health check until it passes or the
    /// per-wave timeout elapses. Empty waves pass immediately.
    async fn gate(&self, wave: WaveName, cancel: &CancellationToken) -> GateResult {
        let members = &self.waves[wave.index()];
        if members.members.is_empty() {
            debug!(target: "cohort::canary", rollout = %self.rollout_id, wave = %wave, "empty wave; no health gate");
            return GateResult::Passed;
        }
        tokio::select! {
            _ = cancel.cancelled() => return GateResult::Cancelled,
            _ = tokio::time::sleep(self.options.grace) => {}
        }
        let deadline = tokio::time::Instant::now() + self.options.health_timeout;
        let mut ticker = tokio::time::interval(self.options.health_poll.max(MIN_POLL));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return GateResult::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return GateResult::TimedOut,
                _ = ticker.tick() => {
                    if self.health.healthy(members).await {
                        debug!(target: "cohort::canary", rollout = %self.rollout_id, wave = %wave, "wave healthy");
                        return GateResult::Passed;
                    }
                    self.keep_alive().await;
                    debug!(target: "cohort::canary", rollout = %self.rollout_id, wave = %wave, "wave not healthy yet");
                }
            }
        }
    }

    async fn abort(&self, wave: WaveName, reason: String) -> RolloutState {
        error!(
            target: "cohort::canary",
            rollout = %self.rollout_id,
            wave = %wave,
            reason = %reason,
            "rollout aborted"
        );
        self.persist(RolloutState::Aborted, Some(wave), Some(reason.clone()))
            .await;
        self.shared_finish(false, &reason).await;
        RolloutState::Aborted
    }

    /// Write the wave's shared unit straight to COMPLETED, then record the
    /// new state.
    async fn release(&self, wave: WaveName) {
        let unit_id = wave_unit_id(&self.rollout_id, wave);
        let members = self.waves[wave.index()].members.clone();
        let rollout_id = self.rollout_id.clone();
        let now = self.ctx.now();
        let released = self
            .kernel
            .blocking(move |k| {
                let tasks = k.tasks();
                let new = NewTask::new(&unit_id, Owner::Shared, TaskSource::Ritual)
                    .correlation(rollout_id)
                    .description(format!("release {wave} wave"))
                    .context(json!({ "wave": wave, "members": members }));
                tasks.insert(&new, now)?;
                let Some(task) = tasks.get(&unit_id)? else {
                    return Ok(());
                };
                if task.status == TaskStatus::Pending {
                    tasks.set_status(&unit_id, TaskStatus::Active, None, None, now)?;
                }
                if !task.status.is_terminal() {
                    tasks.set_status(&unit_id, TaskStatus::Completed, None, None, now)?;
                }
                Ok(())
            })
            .await;
        if let Err(err) = released {
            warn!(target: "cohort::canary", rollout = %self.rollout_id, wave = %wave, error = %err, "failed to write wave unit");
        }
        info!(target: "cohort::canary", rollout = %self.rollout_id, wave = %wave, "wave released");
        self.journal
            .record_async(
                cohort_topics::TOPIC_ROLLOUT_WAVE_RELEASED,
                self.ctx.occurrence_id().as_str(),
                now,
                &json!({ "corr_id": self.rollout_id, "wave": wave, "members": self.waves[wave.index()].members }),
            )
            .await;
        self.persist(RolloutState::for_wave(wave), Some(wave), None)
            .await;
    }

    async fn persist(&self, state: RolloutState, released: Option<WaveName>, reason: Option<String>) {
        let now = self.ctx.now();
        let record = RolloutRecord {
            rollout_id: self.rollout_id.clone(),
            kind: self.kind.clone(),
            initiator: self.ctx.occurrence_id().to_string(),
            state: state.as_str().to_string(),
            released_wave: released.map(|w| w.as_str().to_string()),
            reason: reason.clone(),
            created_at: self.started_at,
            updated_at: now,
        };
        let written = {
            let record = record.clone();
            self.kernel
                .blocking(move |k| {
                    let rollouts = k.rollouts();
                    let current = rollouts
                        .get(&record.rollout_id)?
                        .and_then(|r| RolloutState::from_slug(&r.state))
                        .unwrap_or(RolloutState::NotStarted);
                    if !current.next().contains(&state) {
                        return Ok(Some(current));
                    }
                    rollouts.upsert(&record)?;
                    Ok(None)
                })
                .await
        };
        match written {
            Ok(None) => {}
            Ok(Some(current)) => {
                warn!(
                    target: "cohort::canary",
                    rollout = %self.rollout_id,
                    from = %current,
                    to = %state,
                    "refusing rollout state change"
                );
                return;
            }
            Err(err) => {
                warn!(target: "cohort::canary", rollout = %self.rollout_id, error = %err, "failed to persist rollout state");
            }
        }
        self.journal
            .record_async(
                cohort_topics::TOPIC_ROLLOUT_STATE_CHANGED,
                self.ctx.occurrence_id().as_str(),
                now,
                &json!({
                    "corr_id": self.rollout_id,
                    "kind": self.kind,
                    "state": state,
                    "released_wave": released,
                    "reason": reason,
                }),
            )
            .await;
    }

    async fn shared_start(&self) {
        let shared = self.shared.clone();
        let id = self.rollout_id.clone();
        let ctx = self.ctx.clone();
        let started = tokio::task::spawn_blocking(move || shared.start(&id, &ctx)).await;
        match started {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                warn!(target: "cohort::canary", rollout = %self.rollout_id, error = %err, "could not activate rollout task")
            }
            Err(err) => {
                warn!(target: "cohort::canary", rollout = %self.rollout_id, error = %err, "rollout task activation panicked")
            }
        }
    }

    async fn shared_finish(&self, success: bool, notes: &str) {
        let shared = self.shared.clone();
        let id = self.rollout_id.clone();
        let ctx = self.ctx.clone();
        let notes = notes.to_string();
        let finished =
            tokio::task::spawn_blocking(move || shared.finish(&id, success, Some(&notes), &ctx)).await;
        if !matches!(finished, Ok(Ok(_))) {
            warn!(target: "cohort::canary", rollout = %self.rollout_id, success, "could not close rollout task");
        }
    }

    async fn keep_alive(&self) {
        let shared = self.shared.clone();
        let id = self.rollout_id.clone();
        let ctx = self.ctx.clone();
        if !matches!(
            tokio::task::spawn_blocking(move || shared.keep_alive(&id, &ctx)).await,
            Ok(Ok(true))
        ) {
            debug!(target: "cohort::canary", rollout = %self.rollout_id, "rollout task not refreshed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ClaimCoordinator;
    use crate::clock::ManualClock;
    use crate::shared::SharedTaskOptions;
    use crate::test_support::{ctx, noon, occ, store};
    use cohort_events::Bus;

    fn members(ids: &[&str]) -> BTreeSet<OccurrenceId> {
        ids.iter().map(|id| occ(id)).collect()
    }

    fn sizes(waves: &[CanaryWave]) -> Vec<usize> {
        waves.iter().map(|w| w.members.len()).collect()
    }

    #[test]
    fn nine_members_split_one_three_five() {
        let set = members(&["i", "c", "a", "h", "b", "g", "d", "f", "e"]);
        let waves = partition(&set, 30);
        assert_eq!(sizes(&waves), vec![1, 3, 5]);
        assert_eq!(waves[0].members, vec![occ("a")]);
        assert_eq!(waves[1].members, vec![occ("b"), occ("c"), occ("d")]);
        assert_eq!(sizes(&waves).iter().sum::<usize>(), 9);
        assert_eq!(wave_of(&waves, &occ("i")), Some(WaveName::General));
        assert_eq!(wave_of(&waves, &occ("z")), None);
    }

    #[test]
    fn small_and_extreme_sets() {
        assert_eq!(sizes(&partition(&members(&[]), 30)), vec![0, 0, 0]);
        assert_eq!(sizes(&partition(&members(&["a"]), 30)), vec![1, 0, 0]);
        assert_eq!(sizes(&partition(&members(&["a", "b"]), 30)), vec![1, 1, 0]);
        assert_eq!(sizes(&partition(&members(&["a", "b", "c"]), 0)), vec![1, 0, 2]);
        assert_eq!(sizes(&partition(&members(&["a", "b", "c"]), 100)), vec![1, 2, 0]);
        assert_eq!(sizes(&partition(&members(&["a", "b", "c"]), 250)), vec![1, 2, 0]);
    }

    #[test]
    fn rollout_states_form_a_chain() {
        let mut state = RolloutState::NotStarted;
        let mut seen = vec![state];
        while let Some(next) = state.next().first().copied() {
            state = next;
            seen.push(state);
        }
        assert_eq!(seen.last(), Some(&RolloutState::Done));
        assert_eq!(seen.len(), 5);
        for s in RolloutState::ALL {
            assert_eq!(RolloutState::from_slug(s.as_str()), Some(s));
            if s.wave().is_some() {
                assert!(s.next().contains(&RolloutState::Aborted));
            }
        }
        assert_eq!(WaveName::General.next(), None);
        assert_eq!(WaveName::from_slug("early_adopter"), Some(WaveName::EarlyAdopter));
    }

    fn stored_state(kernel: &Kernel, id: &str) -> Option<String> {
        kernel.rollouts().get(id).unwrap().map(|r| r.state)
    }

    #[tokio::test]
    async fn persisted_states_follow_the_transition_table() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let journal = Journal::new(kernel.clone(), Bus::default());
        let claims = ClaimCoordinator::new(kernel.clone(), journal.clone());
        let shared = SharedTasks::new(
            kernel.clone(),
            claims,
            journal.clone(),
            SharedTaskOptions::default(),
        );
        let id = "WAKEUP_SHARED_20251107";
        let run = RolloutRun {
            kernel: kernel.clone(),
            shared,
            journal,
            options: CanaryOptions::default(),
            health: Arc::new(|_: &CanaryWave| true),
            ctx: ctx("occ-1", &clock),
            rollout_id: id.to_string(),
            kind: "wakeup".to_string(),
            started_at: noon(),
            waves: partition(&members(&["occ-1"]), 30),
        };

        run.persist(RolloutState::Done, Some(WaveName::General), None).await;
        assert_eq!(stored_state(&kernel, id), None);

        run.persist(RolloutState::WaveExplorer, Some(WaveName::Explorer), None)
            .await;
        run.persist(RolloutState::WaveGeneral, Some(WaveName::General), None)
            .await;
        assert_eq!(stored_state(&kernel, id).as_deref(), Some("wave_explorer"));

        run.persist(
            RolloutState::Aborted,
            Some(WaveName::Explorer),
            Some("stopped".to_string()),
        )
        .await;
        run.persist(RolloutState::WaveEarlyAdopter, Some(WaveName::EarlyAdopter), None)
            .await;
        assert_eq!(stored_state(&kernel, id).as_deref(), Some("aborted"));
        assert_eq!(
            kernel.rollouts().get(id).unwrap().unwrap().reason.as_deref(),
            Some("stopped")
        );
    }
}
