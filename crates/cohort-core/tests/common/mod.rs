#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use cohort_core::{Config, Coordination, ManualClock, OccurrenceContext};
use cohort_events::Bus;
use cohort_kernel::{Kernel, OccurrenceId};

pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 7, 12, 0, 0).unwrap()
}

pub fn occ(id: &str) -> OccurrenceId {
    OccurrenceId::new(id).expect("occurrence id")
}

pub fn ctx(id: &str, clock: &Arc<ManualClock>) -> OccurrenceContext {
    OccurrenceContext::new(occ(id), clock.clone())
}

/// One occurrence's view of the store: its own kernel handle and coordinators,
/// as if it were a separate process.
pub fn node(dir: &Path, cfg: &Config) -> Coordination {
    let kernel = Kernel::open(dir).expect("open kernel");
    Coordination::new(kernel, Bus::default(), cfg).expect("coordination")
}
