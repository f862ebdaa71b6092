use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// Reserved owner value meaning "unowned; any occurrence may claim".
pub const SHARED_OWNER: &str = "__shared__";

/// Identity of one running process instance of the agent.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OccurrenceId(String);

impl OccurrenceId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() || trimmed == SHARED_OWNER {
            return Err(KernelError::InvalidOccurrence(id));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OccurrenceId {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<OccurrenceId> for String {
    fn from(value: OccurrenceId) -> Self {
        value.0
    }
}

impl fmt::Display for OccurrenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner of a task or ticket: a real occurrence or the shared sentinel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Owner {
    Shared,
    Occurrence(OccurrenceId),
}

impl Owner {
    pub fn as_str(&self) -> &str {
        match self {
            Owner::Shared => SHARED_OWNER,
            Owner::Occurrence(id) => id.as_str(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Owner::Shared)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw == SHARED_OWNER {
            Ok(Owner::Shared)
        } else {
            OccurrenceId::new(raw)
                .map(Owner::Occurrence)
                .map_err(|_| KernelError::corrupt("owner", raw))
        }
    }
}

impl From<OccurrenceId> for Owner {
    fn from(value: OccurrenceId) -> Self {
        Owner::Occurrence(value)
    }
}

impl From<&OccurrenceId> for Owner {
    fn from(value: &OccurrenceId) -> Self {
        Owner::Occurrence(value.clone())
    }
}

impl TryFrom<String> for Owner {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self> {
        Owner::parse(&value)
    }
}

impl From<Owner> for String {
    fn from(value: Owner) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Active,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Valid next states.
    pub const fn next(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[TaskStatus::Active, TaskStatus::Failed],
            TaskStatus::Active => &[TaskStatus::Completed, TaskStatus::Failed],
            TaskStatus::Completed | TaskStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        self.next().contains(&to)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Assigned,
    InProgress,
    Blocked,
    Deferred,
    Completed,
    Failed,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 7] = [
        TicketStatus::Pending,
        TicketStatus::Assigned,
        TicketStatus::InProgress,
        TicketStatus::Blocked,
        TicketStatus::Deferred,
        TicketStatus::Completed,
        TicketStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::Assigned => "assigned",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Blocked => "blocked",
            TicketStatus::Deferred => "deferred",
            TicketStatus::Completed => "completed",
            TicketStatus::Failed => "failed",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|s| s.as_str() == normalized)
    }

    /// Valid next states.
    pub const fn next(&self) -> &'static [TicketStatus] {
        match self {
            TicketStatus::Pending => &[TicketStatus::Assigned],
            TicketStatus::Assigned => &[TicketStatus::InProgress],
            TicketStatus::InProgress => &[
                TicketStatus::Completed,
                TicketStatus::Failed,
                TicketStatus::Blocked,
                TicketStatus::Deferred,
            ],
            TicketStatus::Blocked | TicketStatus::Deferred => &[TicketStatus::InProgress],
            TicketStatus::Completed | TicketStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, to: TicketStatus) -> bool {
        self.next().contains(&to)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Completed | TicketStatus::Failed)
    }

    /// Statuses in which the owning occurrence keeps generating work.
    pub fn is_workable(&self) -> bool {
        matches!(self, TicketStatus::Assigned | TicketStatus::InProgress)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a timestamp in the single fixed-width form stored in every table,
/// so that string comparison in SQL orders the same way as time.
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(column: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| KernelError::corrupt(column, raw))
}

pub(crate) fn parse_ts_opt(column: &'static str, raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(column, &s)).transpose()
}
