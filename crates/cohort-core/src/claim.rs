//! The claim-or-discover-owner primitive.
//!
//! A claim is a single conditional insert into the `claims` table followed by
//! a read of whichever row won. Ticket claiming, ritual claiming and rollout
//! leadership all go through [`ClaimCoordinator::try_claim`].

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use cohort_kernel::{ClaimRow, Kernel, OccurrenceId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::context::OccurrenceContext;
use crate::error::Result;
use crate::journal::Journal;

/// Deterministic identity of a unit of work.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimKey(String);

impl ClaimKey {
    pub fn ticket(ticket_id: &str) -> Self {
        Self(cohort_kernel::ticket_claim_key(ticket_id))
    }

    /// One-shot decision bucketed per day, e.g. `WAKEUP_SHARED_20251107`.
    pub fn ritual(kind: &str, day: NaiveDate) -> Self {
        Self(format!(
            "{}_SHARED_{}",
            kind.trim().to_ascii_uppercase(),
            day.format("%Y%m%d")
        ))
    }

    pub fn unit(kind: &str, id: &str) -> Self {
        Self(format!("{kind}:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// This call inserted the claim.
    Acquired {
        owner: OccurrenceId,
        claimed_at: DateTime<Utc>,
    },
    /// The caller already held the claim from an earlier call.
    AlreadyHeld {
        owner: OccurrenceId,
        claimed_at: DateTime<Utc>,
    },
    /// Another occurrence holds it. A normal branch, not an error.
    Conflict {
        owner: OccurrenceId,
        claimed_at: DateTime<Utc>,
    },
}

impl ClaimOutcome {
    pub fn acquired(&self) -> bool {
        matches!(self, ClaimOutcome::Acquired { .. })
    }

    pub fn owned_by_caller(&self) -> bool {
        !matches!(self, ClaimOutcome::Conflict { .. })
    }

    pub fn owner(&self) -> &OccurrenceId {
        match self {
            ClaimOutcome::Acquired { owner, .. }
            | ClaimOutcome::AlreadyHeld { owner, .. }
            | ClaimOutcome::Conflict { owner, .. } => owner,
        }
    }

    pub fn claimed_at(&self) -> DateTime<Utc> {
        match self {
            ClaimOutcome::Acquired { claimed_at, .. }
            | ClaimOutcome::AlreadyHeld { claimed_at, .. }
            | ClaimOutcome::Conflict { claimed_at, .. } => *claimed_at,
        }
    }
}

#[derive(Clone)]
pub struct ClaimCoordinator {
    kernel: Kernel,
    journal: Journal,
}

impl ClaimCoordinator {
    pub fn new(kernel: Kernel, journal: Journal) -> Self {
        Self { kernel, journal }
    }

    /// Claim `key` for the calling occurrence, or learn who holds it.
    /// Repeating the call as the owner changes nothing.
    pub fn try_claim(&self, key: &ClaimKey, ctx: &OccurrenceContext) -> Result<ClaimOutcome> {
        let now = ctx.now();
        let (inserted, row) =
            self.kernel
                .claims()
                .insert_if_absent(key.as_str(), ctx.occurrence_id(), now)?;
        let ClaimRow {
            owner, claimed_at, ..
        } = row;
        let outcome = if inserted {
            ClaimOutcome::Acquired { owner, claimed_at }
        } else if &owner == ctx.occurrence_id() {
            ClaimOutcome::AlreadyHeld { owner, claimed_at }
        } else {
            ClaimOutcome::Conflict { owner, claimed_at }
        };
        debug!(
            target: "cohort::claim",
            key = %key,
            occurrence = %ctx.occurrence_id(),
            owner = %outcome.owner(),
            acquired = outcome.acquired(),
            "claim attempted"
        );
        if outcome.acquired() {
            self.journal.record(
                cohort_topics::TOPIC_CLAIM_ACQUIRED,
                ctx.occurrence_id().as_str(),
                now,
                &json!({ "corr_id": key.as_str(), "owner": outcome.owner() }),
            );
        }
        Ok(outcome)
    }

    pub async fn try_claim_async(
        &self,
        key: &ClaimKey,
        ctx: &OccurrenceContext,
    ) -> Result<ClaimOutcome> {
        let this = self.clone();
        let key = key.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || this.try_claim(&key, &ctx))
            .await
            .map_err(|e| cohort_kernel::KernelError::Join(e.to_string()))?
    }

    pub fn holder(&self, key: &ClaimKey) -> Result<Option<ClaimRow>> {
        Ok(self.kernel.claims().get(key.as_str())?)
    }

    /// Drop a claim only if it is still exactly `observed`, so that two
    /// occurrences reclaiming at once cannot delete each other's fresh claim.
    pub fn release_if_unchanged(&self, observed: &ClaimRow) -> Result<bool> {
        Ok(self.kernel.claims().delete_if_unchanged(observed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_support::{ctx, noon, store};
    use cohort_events::Bus;
    use std::sync::Arc;

    #[test]
    fn keys_are_stable_and_kind_is_uppercased() {
        let day = NaiveDate::from_ymd_opt(2025, 11, 7).unwrap();
        assert_eq!(ClaimKey::ritual("wakeup", day).as_str(), "WAKEUP_SHARED_20251107");
        assert_eq!(ClaimKey::ticket("T1").as_str(), "ticket:T1");
        assert_eq!(ClaimKey::unit("rollout", "R1").as_str(), "rollout:R1");
    }

    #[test]
    fn repeat_claim_by_owner_is_idempotent() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let coordinator = ClaimCoordinator::new(kernel.clone(), Journal::new(kernel.clone(), Bus::default()));
        let key = ClaimKey::ticket("T1");
        let me = ctx("occ-1", &clock);

        let first = coordinator.try_claim(&key, &me).unwrap();
        assert!(first.acquired());

        clock.advance(chrono::Duration::seconds(30));
        let again = coordinator.try_claim(&key, &me).unwrap();
        assert!(!again.acquired());
        assert!(again.owned_by_caller());
        assert_eq!(again.claimed_at(), noon());

        let other = coordinator.try_claim(&key, &ctx("occ-2", &clock)).unwrap();
        assert!(matches!(other, ClaimOutcome::Conflict { .. }));
        assert_eq!(other.owner().as_str(), "occ-1");
        assert_eq!(kernel.claims().list_for_owner(me.occurrence_id(), 10).unwrap().len(), 1);
    }

    #[test]
    fn release_only_removes_the_observed_claim() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let coordinator = ClaimCoordinator::new(kernel.clone(), Journal::new(kernel, Bus::default()));
        let key = ClaimKey::unit("rollout", "R1");
        coordinator.try_claim(&key, &ctx("occ-1", &clock)).unwrap();
        let observed = coordinator.holder(&key).unwrap().unwrap();
        assert!(coordinator.release_if_unchanged(&observed).unwrap());
        assert!(!coordinator.release_if_unchanged(&observed).unwrap());
        assert!(coordinator.holder(&key).unwrap().is_none());
    }
}
