use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    /// Occurrence that emitted the event, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope stamped with an explicit time; callers pass the time
    /// from their injected clock so journals stay deterministic under test.
    pub fn new<T: Serialize>(kind: &str, at: DateTime<Utc>, payload: &T) -> Self {
        let payload =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        Self {
            time: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: kind.to_string(),
            actor: None,
            payload,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Correlation id carried in the payload, if any.
    pub fn corr_id(&self) -> Option<&str> {
        self.payload.get("corr_id").and_then(|v| v.as_str())
    }
}

/// A simple broadcast bus for JSON-serializable events.
///
/// The bus is process-local. Occurrences never coordinate through it; it only
/// feeds observers (logs, operator tooling) inside one process.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, at: DateTime<Utc>, payload: &T) {
        self.publish_envelope(Envelope::new(kind, at, payload));
    }

    pub fn publish_envelope(&self, env: Envelope) {
        // No receivers is fine; events are best-effort.
        let _ = self.tx.send(env);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256)
    }
}
