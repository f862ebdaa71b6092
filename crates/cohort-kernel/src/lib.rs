use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

mod claims;
mod error;
mod metadata;
mod model;
mod rollouts;
mod tasks;
mod tickets;

pub use claims::{ticket_claim_key, ClaimRow, ClaimStore};
pub use error::{KernelError, Result};
pub use metadata::{MetadataPatch, StageProgress, TicketMetadata};
pub use model::{format_ts, OccurrenceId, Owner, TaskStatus, TicketStatus, SHARED_OWNER};
pub use rollouts::{RolloutRecord, RolloutStore};
pub use tasks::{NewTask, Task, TaskRegistry, TaskSource};
pub use tickets::{NewTicket, Ticket, TicketFilter, TicketRegistry};

const DB_FILE: &str = "cohort.sqlite";
const DEFAULT_BUSY_MS: u64 = 5000;

/// Connection tuning; defaults honour `COHORT_SQLITE_*` environment overrides.
#[derive(Clone, Debug)]
pub struct KernelOptions {
    pub busy_timeout: Duration,
    pub cache_pages: i64,
    pub mmap_mb: Option<i64>,
}

impl KernelOptions {
    pub fn from_env() -> Self {
        // Busy timeout (default 5000ms; override with COHORT_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("COHORT_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BUSY_MS);
        // Cache size: negative = KB units. Default ~= 20MB (20000 KB pages)
        let cache_pages: i64 = std::env::var("COHORT_SQLITE_CACHE_PAGES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(-20000);
        let mmap_mb = std::env::var("COHORT_SQLITE_MMAP_MB")
            .ok()
            .and_then(|s| s.parse::<i64>().ok());
        Self {
            busy_timeout: Duration::from_millis(busy_ms),
            cache_pages,
            mmap_mb,
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Handle onto the shared store. Cheap to clone; every call opens its own
/// connection so separate handles behave like separate processes.
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    busy_timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventRow {
    pub id: i64,
    pub time: String,
    pub kind: String,
    pub actor: Option<String>,
    pub corr_id: Option<String>,
    pub payload: serde_json::Value,
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with(dir, KernelOptions::from_env())
    }

    pub fn open_with(dir: &Path, opts: KernelOptions) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;
        // Set before anything else so concurrent openers wait instead of failing.
        conn.busy_timeout(opts.busy_timeout)?;
        // Pragmas tuned for many writers across processes
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let _ = conn.pragma_update(None, "cache_size", opts.cache_pages);
        // Keep temp tables in memory
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        if let Some(mb) = opts.mmap_mb {
            let bytes: i64 = mb.max(0) * 1024 * 1024;
            let _ = conn.pragma_update(None, "mmap_size", bytes);
        }
        Self::init_schema(&conn)?;
        Ok(Self {
            db_path,
            busy_timeout: opts.busy_timeout,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Claims: one row per claimed key; the row is the mutual exclusion
            CREATE TABLE IF NOT EXISTS claims (
              claim_key TEXT PRIMARY KEY,
              owner TEXT NOT NULL,
              claimed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_claims_owner ON claims(owner);

            CREATE TABLE IF NOT EXISTS tasks (
              task_id TEXT PRIMARY KEY,
              owner TEXT NOT NULL,
              status TEXT NOT NULL,
              priority INTEGER NOT NULL DEFAULT 0,
              correlation_id TEXT,
              source TEXT NOT NULL,
              description TEXT NOT NULL DEFAULT '',
              context TEXT NOT NULL,
              notes TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_owner_status ON tasks(owner, status);
            CREATE INDEX IF NOT EXISTS idx_tasks_corr ON tasks(correlation_id);
            -- At most one ACTIVE task per (correlation, owner)
            CREATE UNIQUE INDEX IF NOT EXISTS ux_tasks_active_corr
              ON tasks(correlation_id, owner)
              WHERE status = 'active' AND correlation_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS tickets (
              ticket_id TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              status TEXT NOT NULL,
              owner TEXT NOT NULL,
              priority INTEGER NOT NULL DEFAULT 0,
              correlation_id TEXT,
              metadata TEXT NOT NULL,
              notes TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tickets_status_owner ON tickets(status, owner);
            CREATE INDEX IF NOT EXISTS idx_tickets_corr ON tickets(correlation_id);

            CREATE TABLE IF NOT EXISTS rollouts (
              rollout_id TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              initiator TEXT NOT NULL,
              state TEXT NOT NULL,
              released_wave TEXT,
              reason TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS occurrence_heartbeats (
              occurrence_id TEXT PRIMARY KEY,
              last_seen TEXT NOT NULL
            );

            -- Append-only journal for operators
            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              time TEXT NOT NULL,
              kind TEXT NOT NULL,
              actor TEXT,
              corr_id TEXT,
              payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            CREATE INDEX IF NOT EXISTS idx_events_corr ON events(corr_id);
            "#,
        )?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn claims(&self) -> ClaimStore {
        ClaimStore::new(self.clone())
    }

    pub fn tasks(&self) -> TaskRegistry {
        TaskRegistry::new(self.clone())
    }

    pub fn tickets(&self) -> TicketRegistry {
        TicketRegistry::new(self.clone())
    }

    pub fn rollouts(&self) -> RolloutStore {
        RolloutStore::new(self.clone())
    }

    /// Run a blocking store call on the blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Kernel) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let k = self.clone();
        tokio::task::spawn_blocking(move || f(k))
            .await
            .map_err(|e| KernelError::Join(e.to_string()))?
    }

    pub fn append_event(&self, env: &cohort_events::Envelope) -> Result<i64> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&env.payload)?;
        conn.execute(
            "INSERT INTO events(time,kind,actor,corr_id,payload) VALUES (?,?,?,?,?)",
            params![
                env.time,
                env.kind,
                env.actor,
                env.corr_id().map(|s| s.to_string()),
                payload
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_events(&self, limit: i64, after_id: Option<i64>) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        let mut stmt_after;
        let mut stmt_all;
        let mut rows = if let Some(aid) = after_id {
            stmt_after = conn.prepare(
                "SELECT id,time,kind,actor,corr_id,payload FROM events WHERE id>? ORDER BY id ASC LIMIT ?",
            )?;
            stmt_after.query(params![aid, limit])?
        } else {
            stmt_all = conn.prepare(
                "SELECT id,time,kind,actor,corr_id,payload FROM events ORDER BY id DESC LIMIT ?",
            )?;
            stmt_all.query(params![limit])?
        };
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload_s: String = row.get(5)?;
            out.push(EventRow {
                id: row.get(0)?,
                time: row.get(1)?,
                kind: row.get(2)?,
                actor: row.get(3)?,
                corr_id: row.get(4)?,
                payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
            });
        }
        // Ensure ascending order for replay
        if after_id.is_none() {
            out.reverse();
        }
        Ok(out)
    }

    pub fn events_for_corr(&self, corr_id: &str) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,time,kind,actor,corr_id,payload FROM events WHERE corr_id=? ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([corr_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload_s: String = row.get(5)?;
            out.push(EventRow {
                id: row.get(0)?,
                time: row.get(1)?,
                kind: row.get(2)?,
                actor: row.get(3)?,
                corr_id: row.get(4)?,
                payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
            });
        }
        Ok(out)
    }

    /// Record that `occurrence` is alive at `now`.
    pub fn touch_occurrence(&self, occurrence: &OccurrenceId, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO occurrence_heartbeats(occurrence_id,last_seen) VALUES(?,?)
             ON CONFLICT(occurrence_id) DO UPDATE SET last_seen=excluded.last_seen",
            params![occurrence.as_str(), format_ts(now)],
        )?;
        Ok(())
    }

    /// Occurrences that wrote anything (heartbeat, claim, task, ticket) at or after `since`.
    pub fn recent_writers(&self, since: DateTime<Utc>) -> Result<BTreeSet<OccurrenceId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT occurrence_id FROM occurrence_heartbeats WHERE last_seen >= ?1
             UNION SELECT owner FROM claims WHERE claimed_at >= ?1
             UNION SELECT owner FROM tasks WHERE updated_at >= ?1
             UNION SELECT owner FROM tickets WHERE updated_at >= ?1",
        )?;
        let mut rows = stmt.query(params![format_ts(since)])?;
        let mut out = BTreeSet::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            if let Ok(id) = OccurrenceId::new(raw) {
                out.insert(id);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;

    pub fn kernel() -> (tempfile::TempDir, Kernel) {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("open kernel");
        (dir, kernel)
    }

    pub fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 7, 12, 0, 0).unwrap()
    }

    pub fn occ(id: &str) -> OccurrenceId {
        OccurrenceId::new(id).expect("occurrence id")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    #[test]
    fn reopening_existing_store_keeps_rows() {
        let (dir, kernel) = kernel();
        kernel.touch_occurrence(&occ("occ-1"), noon()).unwrap();
        let again = Kernel::open(dir.path()).unwrap();
        let writers = again.recent_writers(noon()).unwrap();
        assert!(writers.contains(&occ("occ-1")));
    }

    #[test]
    fn recent_writers_respects_window_and_skips_sentinel() {
        let (_dir, kernel) = kernel();
        kernel
            .touch_occurrence(&occ("old"), noon() - ChronoDuration::hours(2))
            .unwrap();
        kernel.touch_occurrence(&occ("fresh"), noon()).unwrap();
        kernel
            .tickets()
            .create(&NewTicket::new("T1", "dsar"), noon())
            .unwrap();

        let writers = kernel
            .recent_writers(noon() - ChronoDuration::minutes(5))
            .unwrap();
        let ids: Vec<&str> = writers.iter().map(|o| o.as_str()).collect();
        assert_eq!(ids, vec!["fresh"]);
    }

    #[test]
    fn events_replay_in_order() {
        let (_dir, kernel) = kernel();
        for kind in ["a.one", "a.two", "a.three"] {
            let env = cohort_events::Envelope::new(kind, noon(), &json!({"corr_id": "R1"}));
            kernel.append_event(&env).unwrap();
        }
        let recent = kernel.recent_events(2, None).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, "a.two");
        assert_eq!(recent[1].kind, "a.three");

        let after = kernel.recent_events(10, Some(recent[0].id)).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(kernel.events_for_corr("R1").unwrap().len(), 3);
    }
}
