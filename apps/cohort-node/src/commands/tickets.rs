use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use cohort_kernel::{NewTicket, OccurrenceId, Owner, Ticket, TicketFilter, TicketMetadata, TicketStatus};

use super::node::Node;
use super::print_json;

#[derive(Args)]
pub struct SubmitArgs {
    /// Ticket id (unique)
    pub id: String,
    /// Kind of work, free text
    #[arg(long)]
    pub kind: String,
    /// Higher priority tickets are claimed first
    #[arg(long, default_value_t = 0)]
    pub priority: i64,
    /// Correlation id shared with related tickets
    #[arg(long)]
    pub correlation: Option<String>,
    /// Do not start work before this RFC3339 instant
    #[arg(long, value_name = "RFC3339")]
    pub defer_until: Option<String>,
    /// Emit JSON instead of a one-line summary
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct TicketsArgs {
    /// Only tickets in this status (pending, assigned, in_progress, ...)
    #[arg(long)]
    pub status: Option<String>,
    /// Only tickets owned by this occurrence ("shared" for unclaimed)
    #[arg(long)]
    pub owner: Option<String>,
    /// Only tickets of this kind
    #[arg(long)]
    pub kind: Option<String>,
    /// Maximum rows
    #[arg(long, default_value_t = 100)]
    pub limit: i64,
    /// Emit JSON instead of a table
    #[arg(long)]
    pub json: bool,
    /// Pretty-print JSON output (requires --json)
    #[arg(long, requires = "json")]
    pub pretty: bool,
}

#[derive(Args)]
pub struct TransitionArgs {
    /// Ticket id
    pub id: String,
    /// Target status
    pub status: String,
    /// Notes recorded with the change
    #[arg(long)]
    pub notes: Option<String>,
    /// With `deferred`: pause processing until this RFC3339 instant
    #[arg(long, value_name = "RFC3339")]
    pub defer_until: Option<String>,
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid RFC3339 timestamp: {raw}"))
}

fn parse_status(raw: &str) -> Result<TicketStatus> {
    TicketStatus::from_slug(raw).ok_or_else(|| {
        let known: Vec<&str> = TicketStatus::ALL.iter().map(|s| s.as_str()).collect();
        anyhow!("unknown ticket status {raw:?} (expected one of {})", known.join(", "))
    })
}

fn parse_owner(raw: &str) -> Result<Owner> {
    if raw.eq_ignore_ascii_case("shared") {
        return Ok(Owner::Shared);
    }
    Ok(Owner::Occurrence(OccurrenceId::new(raw)?))
}

fn summary(ticket: &Ticket) -> String {
    format!(
        "{:<24} {:<12} {:<16} {:>4}  {}",
        ticket.ticket_id,
        ticket.status.as_str(),
        ticket.owner.as_str(),
        ticket.priority,
        ticket.kind
    )
}

pub async fn submit(node: Node, args: SubmitArgs) -> Result<()> {
    let mut metadata = TicketMetadata::default();
    if let Some(raw) = &args.defer_until {
        metadata.deferred_until = Some(parse_instant(raw)?);
    }
    let mut new = NewTicket::new(&args.id, &args.kind)
        .priority(args.priority)
        .metadata(metadata);
    if let Some(corr) = args.correlation {
        new = new.correlation(corr);
    }
    let ticket = node.coordination.submit_ticket(new, &node.ctx).await?;
    if args.json {
        print_json(&ticket, false)
    } else {
        println!("Submitted {}", ticket.ticket_id);
        Ok(())
    }
}

pub async fn list(node: Node, args: TicketsArgs) -> Result<()> {
    let filter = TicketFilter {
        status: args.status.as_deref().map(parse_status).transpose()?,
        owner: args.owner.as_deref().map(parse_owner).transpose()?,
        kind: args.kind,
        limit: Some(args.limit),
    };
    let tickets = node
        .coordination
        .kernel
        .blocking(move |k| k.tickets().list(&filter))
        .await?;
    if args.json {
        return print_json(&tickets, args.pretty);
    }
    if tickets.is_empty() {
        println!("No tickets.");
        return Ok(());
    }
    for ticket in &tickets {
        println!("{}", summary(ticket));
    }
    Ok(())
}

pub async fn transition(node: Node, args: TransitionArgs) -> Result<()> {
    let status = parse_status(&args.status)?;
    let defer_until = args.defer_until.as_deref().map(parse_instant).transpose()?;
    if defer_until.is_some() && status != TicketStatus::Deferred {
        anyhow::bail!("--defer-until only applies to the deferred status");
    }
    let mut ticket = node
        .coordination
        .transition_ticket(&args.id, status, args.notes, &node.ctx)
        .await?;
    if defer_until.is_some() {
        ticket = node
            .coordination
            .defer_ticket(&args.id, defer_until, &node.ctx)
            .await?;
    }
    println!("{}", summary(&ticket));
    Ok(())
}
