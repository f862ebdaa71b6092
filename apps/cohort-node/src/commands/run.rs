use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use cohort_core::TaskProcessor;
use cohort_kernel::Task;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::node::Node;

#[derive(Args)]
pub struct RunArgs {
    /// Stop after this many rounds (default: run until interrupted)
    #[arg(long)]
    pub rounds: Option<u64>,
    /// Round interval in milliseconds; overrides coordination.round_interval_ms
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval_ms: Option<u64>,
    /// Print each round report as one JSON line
    #[arg(long)]
    pub json: bool,
}

/// Announces created tasks; the work itself happens elsewhere and reports
/// back through `cohort-node complete`.
struct AnnounceTasks;

#[async_trait]
impl TaskProcessor for AnnounceTasks {
    async fn accept(&self, task: &Task) -> anyhow::Result<()> {
        info!(
            target: "cohort::node",
            task = %task.task_id,
            ticket = task.correlation_id.as_deref().unwrap_or("-"),
            source = %task.source,
            "task ready"
        );
        Ok(())
    }
}

pub async fn run(node: Node, args: RunArgs) -> Result<()> {
    let Node {
        config,
        coordination,
        ctx,
    } = node;
    let interval = args
        .interval_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.round_interval());
    let discovery = coordination
        .discovery
        .clone()
        .with_processor(Arc::new(AnnounceTasks));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    info!(
        target: "cohort::node",
        occurrence = %ctx.occurrence_id(),
        interval_ms = interval.as_millis() as u64,
        "occurrence running"
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rounds = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match coordination.reaper.reap_async(&ctx).await {
            Ok(reaped) if !reaped.is_empty() => {
                info!(target: "cohort::node", count = reaped.len(), "reaped stuck tasks")
            }
            Ok(_) => {}
            Err(err) => warn!(target: "cohort::node", error = %err, "stale task reaper failed"),
        }
        let report = discovery.run_round_report(&ctx).await;
        if args.json {
            super::print_json(&report, false)?;
        }
        rounds += 1;
        if args.rounds.is_some_and(|max| rounds >= max) {
            break;
        }
    }
    info!(target: "cohort::node", rounds, "occurrence stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!(target: "cohort::node", "shutdown signal received");
    cancel.cancel();
}
