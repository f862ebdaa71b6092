use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{format_ts, parse_ts, OccurrenceId};
use crate::Kernel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRow {
    pub claim_key: String,
    pub owner: OccurrenceId,
    pub claimed_at: DateTime<Utc>,
}

/// Claim key guarding a ticket's PENDING → ASSIGNED move.
pub fn ticket_claim_key(ticket_id: &str) -> String {
    format!("ticket:{ticket_id}")
}

/// Conditional-write primitive over the `claims` table.
#[derive(Clone)]
pub struct ClaimStore {
    kernel: Kernel,
}

impl ClaimStore {
    pub(crate) fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }

    /// Insert a claim for `key` unless one exists, then read back the row that
    /// won. Returns whether this call inserted it.
    pub fn insert_if_absent(
        &self,
        key: &str,
        owner: &OccurrenceId,
        now: DateTime<Utc>,
    ) -> Result<(bool, ClaimRow)> {
        let mut conn = self.kernel.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO claims(claim_key,owner,claimed_at) VALUES(?,?,?)",
            params![key, owner.as_str(), format_ts(now)],
        )? == 1;
        let (owner_s, claimed_s): (String, String) = tx.query_row(
            "SELECT owner,claimed_at FROM claims WHERE claim_key=?",
            [key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        tx.commit()?;
        Ok((
            inserted,
            ClaimRow {
                claim_key: key.to_string(),
                owner: OccurrenceId::new(owner_s)?,
                claimed_at: parse_ts("claimed_at", &claimed_s)?,
            },
        ))
    }

    pub fn get(&self, key: &str) -> Result<Option<ClaimRow>> {
        let conn = self.kernel.conn()?;
        let raw: Option<(String, String)> = conn
            .query_row(
                "SELECT owner,claimed_at FROM claims WHERE claim_key=?",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        raw.map(|(owner, claimed)| {
            Ok(ClaimRow {
                claim_key: key.to_string(),
                owner: OccurrenceId::new(owner)?,
                claimed_at: parse_ts("claimed_at", &claimed)?,
            })
        })
        .transpose()
    }

    /// Delete the claim only if it is still the exact row the caller observed.
    pub fn delete_if_unchanged(&self, row: &ClaimRow) -> Result<bool> {
        let conn = self.kernel.conn()?;
        let n = conn.execute(
            "DELETE FROM claims WHERE claim_key=? AND owner=? AND claimed_at=?",
            params![
                row.claim_key,
                row.owner.as_str(),
                format_ts(row.claimed_at)
            ],
        )?;
        Ok(n == 1)
    }

    pub fn list_for_owner(&self, owner: &OccurrenceId, limit: i64) -> Result<Vec<ClaimRow>> {
        let conn = self.kernel.conn()?;
        let mut stmt = conn.prepare(
            "SELECT claim_key,claimed_at FROM claims WHERE owner=? ORDER BY claimed_at DESC LIMIT ?",
        )?;
        let mut rows = stmt.query(params![owner.as_str(), limit])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            let claimed: String = r.get(1)?;
            out.push(ClaimRow {
                claim_key: r.get(0)?,
                owner: owner.clone(),
                claimed_at: parse_ts("claimed_at", &claimed)?,
            });
        }
        Ok(out)
    }
}
