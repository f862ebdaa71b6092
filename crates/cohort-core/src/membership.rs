use std::collections::BTreeSet;
use std::time::Duration;

use cohort_kernel::{Kernel, OccurrenceId};
use serde_json::json;
use tracing::{debug, warn};

use crate::context::OccurrenceContext;
use crate::error::{CoordinationError, Result};
use crate::journal::Journal;

/// Where the member list comes from.
#[derive(Clone, Debug)]
pub enum MembershipSource {
    /// Externally supplied list.
    Static(Vec<OccurrenceId>),
    /// Occurrences that wrote to the store within the trailing window.
    Liveness { window: Duration },
}

#[derive(Clone)]
pub struct OccurrenceDiscovery {
    kernel: Kernel,
    journal: Journal,
    source: MembershipSource,
}

impl OccurrenceDiscovery {
    pub fn new(kernel: Kernel, journal: Journal, source: MembershipSource) -> Self {
        Self {
            kernel,
            journal,
            source,
        }
    }

    pub fn source(&self) -> &MembershipSource {
        &self.source
    }

    /// Current members, always including the caller.
    pub fn try_discover(&self, ctx: &OccurrenceContext) -> Result<BTreeSet<OccurrenceId>> {
        let mut members = match &self.source {
            MembershipSource::Static(list) => list.iter().cloned().collect(),
            MembershipSource::Liveness { window } => {
                let span = chrono::Duration::from_std(*window)
                    .map_err(|e| CoordinationError::DiscoveryFailure(e.to_string()))?;
                self.kernel
                    .recent_writers(ctx.now() - span)
                    .map_err(|e| CoordinationError::DiscoveryFailure(e.to_string()))?
            }
        };
        members.insert(ctx.occurrence_id().clone());
        Ok(members)
    }

    /// Like [`Self::try_discover`] but never fails: on error the caller is
    /// the sole member and the degradation is logged and journaled.
    pub fn discover(&self, ctx: &OccurrenceContext) -> BTreeSet<OccurrenceId> {
        match self.try_discover(ctx) {
            Ok(members) => {
                debug!(target: "cohort::membership", count = members.len(), "membership discovered");
                members
            }
            Err(err) => {
                warn!(
                    target: "cohort::membership",
                    occurrence = %ctx.occurrence_id(),
                    error = %err,
                    "membership discovery degraded; assuming sole member"
                );
                self.journal.record(
                    cohort_topics::TOPIC_MEMBERSHIP_DEGRADED,
                    ctx.occurrence_id().as_str(),
                    ctx.now(),
                    &json!({ "error": err.to_string() }),
                );
                BTreeSet::from([ctx.occurrence_id().clone()])
            }
        }
    }

    pub async fn discover_async(&self, ctx: &OccurrenceContext) -> BTreeSet<OccurrenceId> {
        let this = self.clone();
        let task_ctx = ctx.clone();
        match tokio::task::spawn_blocking(move || this.discover(&task_ctx)).await {
            Ok(members) => members,
            Err(err) => {
                warn!(target: "cohort::membership", error = %err, "membership task failed");
                BTreeSet::from([ctx.occurrence_id().clone()])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_support::{ctx, noon, occ, store};
    use cohort_events::Bus;
    use std::sync::Arc;

    #[test]
    fn static_list_always_contains_self() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let discovery = OccurrenceDiscovery::new(
            kernel.clone(),
            Journal::new(kernel, Bus::default()),
            MembershipSource::Static(vec![occ("b"), occ("a")]),
        );
        let members: Vec<String> = discovery
            .discover(&ctx("c", &clock))
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(members, vec!["a", "b", "c"]);
    }

    #[test]
    fn liveness_window_drops_quiet_occurrences() {
        let (_dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        kernel
            .touch_occurrence(&occ("quiet"), noon() - chrono::Duration::hours(1))
            .unwrap();
        kernel.touch_occurrence(&occ("busy"), noon()).unwrap();
        let discovery = OccurrenceDiscovery::new(
            kernel.clone(),
            Journal::new(kernel, Bus::default()),
            MembershipSource::Liveness {
                window: Duration::from_secs(600),
            },
        );
        let members = discovery.discover(&ctx("me", &clock));
        assert!(members.contains(&occ("busy")));
        assert!(members.contains(&occ("me")));
        assert!(!members.contains(&occ("quiet")));
    }

    #[test]
    fn unreadable_store_degrades_to_self() {
        let (dir, kernel) = store();
        let clock = Arc::new(ManualClock::new(noon()));
        let bus = Bus::default();
        let discovery = OccurrenceDiscovery::new(
            kernel.clone(),
            Journal::new(kernel.clone(), bus),
            MembershipSource::Liveness {
                window: Duration::from_secs(600),
            },
        );
        // Replace the database file with a directory so every open fails.
        std::fs::remove_file(kernel.db_path()).unwrap();
        let _ = std::fs::remove_file(dir.path().join("cohort.sqlite-wal"));
        let _ = std::fs::remove_file(dir.path().join("cohort.sqlite-shm"));
        std::fs::create_dir(kernel.db_path()).unwrap();

        let me = ctx("solo", &clock);
        assert!(discovery.try_discover(&me).is_err());
        let members = discovery.discover(&me);
        assert_eq!(members.len(), 1);
        assert!(members.contains(&occ("solo")));
    }
}
