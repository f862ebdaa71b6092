use std::sync::Arc;

use chrono::{DateTime, Utc};
use cohort_kernel::{OccurrenceId, Owner};

use crate::clock::{Clock, SystemClock};

/// Identity and time source threaded through every coordination call.
#[derive(Clone)]
pub struct OccurrenceContext {
    occurrence_id: OccurrenceId,
    clock: Arc<dyn Clock>,
}

impl OccurrenceContext {
    pub fn new(occurrence_id: OccurrenceId, clock: Arc<dyn Clock>) -> Self {
        Self {
            occurrence_id,
            clock,
        }
    }

    pub fn system(occurrence_id: OccurrenceId) -> Self {
        Self::new(occurrence_id, Arc::new(SystemClock))
    }

    pub fn occurrence_id(&self) -> &OccurrenceId {
        &self.occurrence_id
    }

    pub fn owner(&self) -> Owner {
        Owner::from(&self.occurrence_id)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }
}

impl std::fmt::Debug for OccurrenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OccurrenceContext")
            .field("occurrence_id", &self.occurrence_id)
            .finish_non_exhaustive()
    }
}
