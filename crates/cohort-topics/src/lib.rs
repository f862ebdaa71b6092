//! Canonical event topic constants shared across occurrences.
//!
//! Topics name events appended to the store journal and published on the
//! in-process bus. Keep this list alphabetized within sections and favor
//! dot.case names.

// Claims
pub const TOPIC_CLAIM_ACQUIRED: &str = "claim.acquired";
pub const TOPIC_CLAIM_RECLAIMED: &str = "claim.reclaimed";

// Discovery rounds
pub const TOPIC_DISCOVERY_ROUND_COMPLETED: &str = "discovery.round.completed";
pub const TOPIC_DISCOVERY_UNIT_FAILED: &str = "discovery.unit.failed";

// Membership
pub const TOPIC_MEMBERSHIP_DEGRADED: &str = "membership.degraded";

// Rollouts
pub const TOPIC_ROLLOUT_STARTED: &str = "rollout.started";
pub const TOPIC_ROLLOUT_STATE_CHANGED: &str = "rollout.state.changed";
pub const TOPIC_ROLLOUT_WAVE_RELEASED: &str = "rollout.wave.released";

// Tasks
pub const TOPIC_TASK_CREATED: &str = "task.created";
pub const TOPIC_TASK_REAPED: &str = "task.reaped";
pub const TOPIC_TASK_STATUS_CHANGED: &str = "task.status.changed";

// Tickets
pub const TOPIC_TICKET_CLAIMED: &str = "ticket.claimed";
pub const TOPIC_TICKET_STATUS_CHANGED: &str = "ticket.status.changed";
pub const TOPIC_TICKET_SUBMITTED: &str = "ticket.submitted";
