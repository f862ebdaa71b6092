use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::error::{conflict_or, KernelError, Result};
use crate::metadata::{MetadataPatch, TicketMetadata};
use crate::model::{format_ts, parse_ts, parse_ts_opt, OccurrenceId, Owner, TicketStatus};
use crate::Kernel;

const TICKET_COLUMNS: &str = "ticket_id,kind,status,owner,priority,correlation_id,metadata,notes,created_at,updated_at,completed_at";

/// A long-running unit of work submitted from outside and driven by whichever
/// occurrence claimed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: String,
    pub kind: String,
    pub status: TicketStatus,
    pub owner: Owner,
    pub priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub metadata: TicketMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Submission payload. Tickets always start PENDING and shared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTicket {
    pub ticket_id: String,
    pub kind: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: TicketMetadata,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewTicket {
    pub fn new(ticket_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn metadata(mut self, metadata: TicketMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub status: Option<TicketStatus>,
    pub owner: Option<Owner>,
    pub kind: Option<String>,
    pub limit: Option<i64>,
}

struct RawTicket {
    ticket_id: String,
    kind: String,
    status: String,
    owner: String,
    priority: i64,
    correlation_id: Option<String>,
    metadata: String,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RawTicket {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            ticket_id: row.get(0)?,
            kind: row.get(1)?,
            status: row.get(2)?,
            owner: row.get(3)?,
            priority: row.get(4)?,
            correlation_id: row.get(5)?,
            metadata: row.get(6)?,
            notes: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            completed_at: row.get(10)?,
        })
    }

    fn into_ticket(self) -> Result<Ticket> {
        let metadata = match serde_json::from_str::<TicketMetadata>(&self.metadata) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(
                    target: "cohort::kernel",
                    ticket = %self.ticket_id,
                    error = %err,
                    "unreadable ticket metadata; using empty"
                );
                TicketMetadata::default()
            }
        };
        Ok(Ticket {
            status: TicketStatus::from_slug(&self.status)
                .ok_or_else(|| KernelError::corrupt("tickets.status", &self.status))?,
            owner: Owner::parse(&self.owner)?,
            created_at: parse_ts("tickets.created_at", &self.created_at)?,
            updated_at: parse_ts("tickets.updated_at", &self.updated_at)?,
            completed_at: parse_ts_opt("tickets.completed_at", self.completed_at)?,
            metadata,
            ticket_id: self.ticket_id,
            kind: self.kind,
            priority: self.priority,
            correlation_id: self.correlation_id,
            notes: self.notes,
        })
    }
}

fn load(tx: &Transaction<'_>, ticket_id: &str) -> Result<Ticket> {
    let raw = tx
        .query_row(
            &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE ticket_id=?"),
            [ticket_id],
            RawTicket::from_row,
        )
        .optional()?
        .ok_or_else(|| KernelError::NotFound {
            entity: "ticket",
            id: ticket_id.to_string(),
        })?;
    raw.into_ticket()
}

/// Validate and write one status change inside an open transaction.
fn apply_status(
    tx: &Transaction<'_>,
    current: &Ticket,
    status: TicketStatus,
    owner: Option<&Owner>,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    if !current.status.can_transition_to(status) {
        return Err(KernelError::InvalidTransition {
            entity: "ticket",
            id: current.ticket_id.clone(),
            from: current.status.to_string(),
            to: status.to_string(),
        });
    }
    let next_owner = owner.unwrap_or(&current.owner);
    if next_owner.is_shared() && status != TicketStatus::Pending {
        return Err(KernelError::InvalidOwner {
            id: current.ticket_id.clone(),
            status: status.to_string(),
        });
    }
    let now_s = format_ts(now);
    let completed = status.is_terminal().then(|| now_s.clone());
    let n = tx.execute(
        "UPDATE tickets SET status=?, owner=?, notes=COALESCE(?,notes), updated_at=?, completed_at=COALESCE(?,completed_at)
         WHERE ticket_id=? AND status=? AND owner=?",
        params![
            status.as_str(),
            next_owner.as_str(),
            notes,
            now_s,
            completed,
            current.ticket_id,
            current.status.as_str(),
            current.owner.as_str()
        ],
    )?;
    if n != 1 {
        return Err(KernelError::Conflict {
            entity: "ticket",
            id: current.ticket_id.clone(),
            detail: "row changed during update".into(),
        });
    }
    Ok(())
}

#[derive(Clone)]
pub struct TicketRegistry {
    kernel: Kernel,
}

impl TicketRegistry {
    pub(crate) fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }

    pub fn create(&self, ticket: &NewTicket, now: DateTime<Utc>) -> Result<Ticket> {
        let conn = self.kernel.conn()?;
        let now_s = format_ts(now);
        conn.execute(
            "INSERT INTO tickets(ticket_id,kind,status,owner,priority,correlation_id,metadata,notes,created_at,updated_at) VALUES(?,?,?,?,?,?,?,?,?,?)",
            params![
                ticket.ticket_id,
                ticket.kind,
                TicketStatus::Pending.as_str(),
                Owner::Shared.as_str(),
                ticket.priority,
                ticket.correlation_id,
                serde_json::to_string(&ticket.metadata)?,
                ticket.notes,
                now_s,
                now_s
            ],
        )
        .map_err(|e| conflict_or(e, "ticket", &ticket.ticket_id))?;
        self.get(&ticket.ticket_id)?.ok_or_else(|| KernelError::NotFound {
            entity: "ticket",
            id: ticket.ticket_id.clone(),
        })
    }

    pub fn get(&self, ticket_id: &str) -> Result<Option<Ticket>> {
        let conn = self.kernel.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE ticket_id=?"),
                [ticket_id],
                RawTicket::from_row,
            )
            .optional()?;
        raw.map(RawTicket::into_ticket).transpose()
    }

    /// The single path for ticket status changes. Re-reads the row under a
    /// write lock, checks the transition table and owner rule, and stamps
    /// `completed_at` on entry to a terminal status.
    pub fn set_status(
        &self,
        ticket_id: &str,
        status: TicketStatus,
        owner: Option<&Owner>,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Ticket> {
        let mut conn = self.kernel.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load(&tx, ticket_id)?;
        apply_status(&tx, &current, status, owner, notes, now)?;
        let updated = load(&tx, ticket_id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// PENDING -> ASSIGNED for a ticket still held by the shared sentinel.
    /// Fails with `Conflict` if it was already taken.
    pub fn claim_pending(
        &self,
        ticket_id: &str,
        owner: &OccurrenceId,
        now: DateTime<Utc>,
    ) -> Result<Ticket> {
        let mut conn = self.kernel.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load(&tx, ticket_id)?;
        if !current.owner.is_shared() {
            return Err(KernelError::Conflict {
                entity: "ticket",
                id: ticket_id.to_string(),
                detail: format!("already owned by {}", current.owner),
            });
        }
        apply_status(
            &tx,
            &current,
            TicketStatus::Assigned,
            Some(&Owner::from(owner)),
            None,
            now,
        )?;
        let updated = load(&tx, ticket_id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Shared PENDING tickets, highest priority first. Unreadable rows are
    /// logged and skipped.
    pub fn shared_pending(&self, limit: i64) -> Result<Vec<Ticket>> {
        self.query_lenient(
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets WHERE status='pending' AND owner=? ORDER BY priority DESC, created_at ASC LIMIT ?"
            ),
            params![Owner::Shared.as_str(), limit],
        )
    }

    /// Tickets owned by `owner` that still need work generated.
    pub fn owned_active(&self, owner: &OccurrenceId, limit: i64) -> Result<Vec<Ticket>> {
        self.query_lenient(
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets WHERE owner=? AND status IN ('assigned','in_progress') ORDER BY priority DESC, created_at ASC LIMIT ?"
            ),
            params![owner.as_str(), limit],
        )
    }

    pub fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        self.query(
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets
                 WHERE (?1 IS NULL OR status=?1) AND (?2 IS NULL OR owner=?2) AND (?3 IS NULL OR kind=?3)
                 ORDER BY created_at DESC LIMIT ?4"
            ),
            params![
                filter.status.map(|s| s.as_str()),
                filter.owner.as_ref().map(|o| o.as_str()),
                filter.kind,
                filter.limit.unwrap_or(100)
            ],
        )
    }

    pub fn by_correlation(&self, correlation_id: &str) -> Result<Vec<Ticket>> {
        self.query(
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets WHERE correlation_id=? ORDER BY created_at ASC"
            ),
            params![correlation_id],
        )
    }

    /// Merge `patch` into the stored metadata under a write lock.
    pub fn update_metadata(
        &self,
        ticket_id: &str,
        patch: MetadataPatch,
        now: DateTime<Utc>,
    ) -> Result<Ticket> {
        let mut conn = self.kernel.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut ticket = load(&tx, ticket_id)?;
        ticket.metadata.apply(patch);
        tx.execute(
            "UPDATE tickets SET metadata=?, updated_at=? WHERE ticket_id=?",
            params![
                serde_json::to_string(&ticket.metadata)?,
                format_ts(now),
                ticket_id
            ],
        )?;
        let updated = load(&tx, ticket_id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Remove the ticket together with its claim, so a ticket resubmitted
    /// under the same id can be claimed again.
    pub fn delete(&self, ticket_id: &str) -> Result<bool> {
        let mut conn = self.kernel.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let n = tx.execute("DELETE FROM tickets WHERE ticket_id=?", [ticket_id])?;
        tx.execute(
            "DELETE FROM claims WHERE claim_key=?",
            [crate::claims::ticket_claim_key(ticket_id)],
        )?;
        tx.commit()?;
        Ok(n == 1)
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Ticket>> {
        let conn = self.kernel.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, RawTicket::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawTicket::into_ticket).collect()
    }

    fn query_lenient(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Ticket>> {
        let conn = self.kernel.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, RawTicket::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut out = Vec::with_capacity(raws.len());
        for raw in raws {
            let id = raw.ticket_id.clone();
            match raw.into_ticket() {
                Ok(ticket) => out.push(ticket),
                Err(err) => {
                    tracing::warn!(target: "cohort::kernel", ticket = %id, error = %err, "skipping unreadable ticket row");
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn lifecycle_follows_transition_table() {
        let (_dir, kernel) = kernel();
        let tickets = kernel.tickets();
        tickets.create(&NewTicket::new("T1", "dsar"), noon()).unwrap();

        let err = tickets
            .set_status("T1", TicketStatus::Completed, None, None, noon())
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidTransition { .. }));

        let me = Owner::from(occ("occ-1"));
        let t = tickets
            .set_status("T1", TicketStatus::Assigned, Some(&me), None, noon())
            .unwrap();
        assert_eq!(t.owner, me);
        assert!(t.completed_at.is_none());
        tickets
            .set_status("T1", TicketStatus::InProgress, None, None, noon())
            .unwrap();
        let done_at = noon() + Duration::minutes(5);
        let t = tickets
            .set_status("T1", TicketStatus::Completed, None, Some("exported"), done_at)
            .unwrap();
        assert_eq!(t.status, TicketStatus::Completed);
        assert_eq!(t.completed_at, Some(done_at));
        assert_eq!(t.notes.as_deref(), Some("exported"));

        let err = tickets
            .set_status("T1", TicketStatus::InProgress, None, None, done_at)
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidTransition { .. }));
    }

    #[test]
    fn delete_drops_the_ticket_claim() {
        let (_dir, kernel) = kernel();
        let tickets = kernel.tickets();
        let claims = kernel.claims();
        let key = crate::claims::ticket_claim_key("T1");
        tickets.create(&NewTicket::new("T1", "dsar"), noon()).unwrap();
        claims.insert_if_absent(&key, &occ("occ-1"), noon()).unwrap();
        tickets.claim_pending("T1", &occ("occ-1"), noon()).unwrap();
        claims.insert_if_absent("ticket:T2", &occ("occ-1"), noon()).unwrap();

        assert!(tickets.delete("T1").unwrap());
        assert!(tickets.get("T1").unwrap().is_none());
        assert!(claims.get(&key).unwrap().is_none());
        assert!(claims.get("ticket:T2").unwrap().is_some());
        assert!(!tickets.delete("T1").unwrap());
    }

    #[test]
    fn shared_owner_is_rejected_outside_pending() {
        let (_dir, kernel) = kernel();
        let tickets = kernel.tickets();
        tickets.create(&NewTicket::new("T1", "dsar"), noon()).unwrap();
        let err = tickets
            .set_status("T1", TicketStatus::Assigned, None, None, noon())
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidOwner { .. }));
        let still = tickets.get("T1").unwrap().unwrap();
        assert_eq!(still.status, TicketStatus::Pending);
    }

    #[test]
    fn claim_pending_only_succeeds_once() {
        let (_dir, kernel) = kernel();
        let tickets = kernel.tickets();
        tickets.create(&NewTicket::new("T1", "dsar"), noon()).unwrap();
        let t = tickets.claim_pending("T1", &occ("occ-1"), noon()).unwrap();
        assert_eq!(t.status, TicketStatus::Assigned);
        let err = tickets.claim_pending("T1", &occ("occ-2"), noon()).unwrap_err();
        assert!(matches!(err, KernelError::Conflict { .. }));
    }

    #[test]
    fn duplicate_create_is_a_conflict() {
        let (_dir, kernel) = kernel();
        let tickets = kernel.tickets();
        tickets.create(&NewTicket::new("T1", "dsar"), noon()).unwrap();
        let err = tickets
            .create(&NewTicket::new("T1", "dsar"), noon())
            .unwrap_err();
        assert!(matches!(err, KernelError::Conflict { .. }));
    }

    #[test]
    fn discovery_queries_split_shared_and_owned() {
        let (_dir, kernel) = kernel();
        let tickets = kernel.tickets();
        tickets
            .create(&NewTicket::new("low", "dsar").priority(1), noon())
            .unwrap();
        tickets
            .create(&NewTicket::new("high", "dsar").priority(9), noon())
            .unwrap();
        tickets
            .create(&NewTicket::new("mine", "dsar"), noon())
            .unwrap();
        tickets.claim_pending("mine", &occ("occ-1"), noon()).unwrap();

        let shared: Vec<String> = tickets
            .shared_pending(10)
            .unwrap()
            .into_iter()
            .map(|t| t.ticket_id)
            .collect();
        assert_eq!(shared, vec!["high", "low"]);

        let owned = tickets.owned_active(&occ("occ-1"), 10).unwrap();
        assert_eq!(owned.len(), 1);
        assert!(tickets.owned_active(&occ("occ-2"), 10).unwrap().is_empty());

        let filter = TicketFilter {
            status: Some(TicketStatus::Pending),
            ..TicketFilter::default()
        };
        assert_eq!(tickets.list(&filter).unwrap().len(), 2);
        let filter = TicketFilter {
            owner: Some(Owner::from(occ("occ-1"))),
            kind: Some("dsar".into()),
            ..TicketFilter::default()
        };
        assert_eq!(tickets.list(&filter).unwrap().len(), 1);
    }

    #[test]
    fn metadata_updates_merge_stages() {
        let (_dir, kernel) = kernel();
        let tickets = kernel.tickets();
        tickets
            .create(&NewTicket::new("T1", "dsar").correlation("req-7"), noon())
            .unwrap();
        tickets
            .update_metadata(
                "T1",
                MetadataPatch::default().stage("identity", "status", json!("done")),
                noon(),
            )
            .unwrap();
        let t = tickets
            .update_metadata(
                "T1",
                MetadataPatch::default()
                    .stage("export", "status", json!("running"))
                    .awaiting_human(true),
                noon(),
            )
            .unwrap();
        assert_eq!(t.metadata.stages.len(), 2);
        assert!(t.metadata.awaiting_human_response);
        assert_eq!(tickets.by_correlation("req-7").unwrap().len(), 1);
        assert!(tickets.delete("T1").unwrap());
        assert!(tickets.get("T1").unwrap().is_none());
    }
}
