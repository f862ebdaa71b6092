//! Helpers shared by unit tests in this crate.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use cohort_kernel::{Kernel, OccurrenceId};

use crate::clock::ManualClock;
use crate::context::OccurrenceContext;

pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 7, 12, 0, 0).unwrap()
}

pub fn occ(id: &str) -> OccurrenceId {
    OccurrenceId::new(id).expect("occurrence id")
}

/// Fresh store in a temp dir; keep the dir alive for the test's duration.
pub fn store() -> (tempfile::TempDir, Kernel) {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = Kernel::open(dir.path()).expect("open kernel");
    (dir, kernel)
}

pub fn ctx(id: &str, clock: &Arc<ManualClock>) -> OccurrenceContext {
    OccurrenceContext::new(occ(id), clock.clone())
}

/// Environment variables set for the lifetime of the value, restored on drop.
/// Pair with `#[serial]` since the process environment is global.
pub mod env {
    pub struct ScopedEnv {
        saved: Vec<(&'static str, Option<String>)>,
    }

    pub fn guard() -> ScopedEnv {
        ScopedEnv { saved: Vec::new() }
    }

    impl ScopedEnv {
        fn remember(&mut self, key: &'static str) {
            if !self.saved.iter().any(|(k, _)| *k == key) {
                self.saved.push((key, std::env::var(key).ok()));
            }
        }

        pub fn set(&mut self, key: &'static str, value: &str) {
            self.remember(key);
            std::env::set_var(key, value);
        }

        pub fn remove(&mut self, key: &'static str) {
            self.remember(key);
            std::env::remove_var(key);
        }
    }

    impl Drop for ScopedEnv {
        fn drop(&mut self) {
            for (key, val) in self.saved.drain(..) {
                match val {
                    Some(v) => std::env::set_var(key, v),
                    None => std::env::remove_var(key),
                }
            }
        }
    }
}
