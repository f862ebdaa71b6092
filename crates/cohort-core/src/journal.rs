use chrono::{DateTime, Utc};
use cohort_events::{Bus, Envelope};
use cohort_kernel::Kernel;
use serde::Serialize;
use tracing::warn;

/// Records coordination events in the store's `events` table and mirrors
/// them onto the in-process bus. Journal failures never fail the caller.
#[derive(Clone)]
pub struct Journal {
    kernel: Kernel,
    bus: Bus,
}

impl Journal {
    pub fn new(kernel: Kernel, bus: Bus) -> Self {
        Self { kernel, bus }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn record<T: Serialize>(&self, kind: &str, actor: &str, at: DateTime<Utc>, payload: &T) {
        let env = Envelope::new(kind, at, payload).with_actor(actor);
        if let Err(err) = self.kernel.append_event(&env) {
            warn!(target: "cohort::journal", kind, error = %err, "failed to journal event");
        }
        self.bus.publish_envelope(env);
    }

    pub async fn record_async<T: Serialize>(
        &self,
        kind: &str,
        actor: &str,
        at: DateTime<Utc>,
        payload: &T,
    ) {
        let env = Envelope::new(kind, at, payload).with_actor(actor);
        let appended = {
            let env = env.clone();
            self.kernel
                .blocking(move |k| k.append_event(&env))
                .await
        };
        if let Err(err) = appended {
            warn!(target: "cohort::journal", kind, error = %err, "failed to journal event");
        }
        self.bus.publish_envelope(env);
    }
}
