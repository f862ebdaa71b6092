use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{format_ts, parse_ts};
use crate::Kernel;

/// Persisted view of one rollout so any occurrence (or an operator) can read
/// its progress. `state` and `released_wave` are owned by the coordinator and
/// stored as slugs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutRecord {
    pub rollout_id: String,
    pub kind: String,
    pub initiator: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_wave: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct RolloutRecordRaw {
    rollout_id: String,
    kind: String,
    initiator: String,
    state: String,
    released_wave: Option<String>,
    reason: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RolloutRecordRaw {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            rollout_id: row.get(0)?,
            kind: row.get(1)?,
            initiator: row.get(2)?,
            state: row.get(3)?,
            released_wave: row.get(4)?,
            reason: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<RolloutRecord> {
        Ok(RolloutRecord {
            created_at: parse_ts("rollouts.created_at", &self.created_at)?,
            updated_at: parse_ts("rollouts.updated_at", &self.updated_at)?,
            rollout_id: self.rollout_id,
            kind: self.kind,
            initiator: self.initiator,
            state: self.state,
            released_wave: self.released_wave,
            reason: self.reason,
        })
    }
}

const ROLLOUT_COLUMNS: &str =
    "rollout_id,kind,initiator,state,released_wave,reason,created_at,updated_at";

#[derive(Clone)]
pub struct RolloutStore {
    kernel: Kernel,
}

impl RolloutStore {
    pub(crate) fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }

    /// Insert or overwrite; `created_at` is kept from the first write.
    pub fn upsert(&self, record: &RolloutRecord) -> Result<()> {
        let conn = self.kernel.conn()?;
        conn.execute(
            "INSERT INTO rollouts(rollout_id,kind,initiator,state,released_wave,reason,created_at,updated_at)
             VALUES(?,?,?,?,?,?,?,?)
             ON CONFLICT(rollout_id) DO UPDATE SET
               state=excluded.state,
               released_wave=excluded.released_wave,
               reason=excluded.reason,
               updated_at=excluded.updated_at",
            params![
                record.rollout_id,
                record.kind,
                record.initiator,
                record.state,
                record.released_wave,
                record.reason,
                format_ts(record.created_at),
                format_ts(record.updated_at)
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, rollout_id: &str) -> Result<Option<RolloutRecord>> {
        let conn = self.kernel.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {ROLLOUT_COLUMNS} FROM rollouts WHERE rollout_id=?"),
                [rollout_id],
                RolloutRecordRaw::from_row,
            )
            .optional()?;
        raw.map(RolloutRecordRaw::into_record).transpose()
    }

    /// Most recent rollouts first, optionally for one kind.
    pub fn list(&self, kind: Option<&str>, limit: i64) -> Result<Vec<RolloutRecord>> {
        let conn = self.kernel.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROLLOUT_COLUMNS} FROM rollouts WHERE (?1 IS NULL OR kind=?1) ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let raws = stmt
            .query_map(params![kind, limit], RolloutRecordRaw::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RolloutRecordRaw::into_record).collect()
    }
}
