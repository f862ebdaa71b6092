//! Typed ticket metadata.
//!
//! Stage progress is the only nested map and merges key-by-key; every other
//! field is replaced wholesale by a patch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Free-form progress fields recorded for one processing stage.
pub type StageProgress = Map<String, Value>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<String, StageProgress>,
    /// Processing is paused until this instant.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub deferred_until: Option<DateTime<Utc>>,
    /// Processing is paused until a human answers.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub awaiting_human_response: bool,
    /// Remaining submitter-defined fields, shallow.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TicketMetadata {
    /// True while the ticket sits in a paused sub-state at `now`.
    pub fn is_paused_at(&self, now: DateTime<Utc>) -> bool {
        self.awaiting_human_response || self.deferred_until.is_some_and(|until| until > now)
    }

    pub fn apply(&mut self, patch: MetadataPatch) {
        for (stage, fields) in patch.stages {
            let entry = self.stages.entry(stage).or_default();
            for (key, value) in fields {
                entry.insert(key, value);
            }
        }
        if let Some(deferred) = patch.deferred_until {
            self.deferred_until = deferred;
        }
        if let Some(awaiting) = patch.awaiting_human_response {
            self.awaiting_human_response = awaiting;
        }
        for (key, value) in patch.extra {
            if value.is_null() {
                self.extra.remove(&key);
            } else {
                self.extra.insert(key, value);
            }
        }
    }
}

/// Partial metadata update. `None` leaves a field untouched; a `null` value in
/// `extra` removes that key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch {
    #[serde(default)]
    pub stages: BTreeMap<String, StageProgress>,
    #[serde(default)]
    pub deferred_until: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub awaiting_human_response: Option<bool>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl MetadataPatch {
    pub fn stage(mut self, stage: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        self.stages
            .entry(stage.into())
            .or_default()
            .insert(key.into(), value);
        self
    }

    pub fn defer_until(mut self, until: Option<DateTime<Utc>>) -> Self {
        self.deferred_until = Some(until);
        self
    }

    pub fn awaiting_human(mut self, awaiting: bool) -> Self {
        self.awaiting_human_response = Some(awaiting);
        self
    }
}

// Older rows may carry hand-written timestamps; an unreadable one means "not deferred".
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) => match DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(_) => {
                tracing::warn!(target: "cohort::kernel", value = %s, "ignoring unparseable deferred_until");
                None
            }
        },
        _ => None,
    })
}
