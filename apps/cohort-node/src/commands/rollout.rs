use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use cohort_core::{CanaryWave, Clock, HealthCheck, RolloutRole};
use cohort_kernel::Kernel;
use tracing::{debug, info};

use super::node::Node;
use super::print_json;

#[derive(Args)]
pub struct RolloutArgs {
    /// Action being rolled out (e.g. wakeup, shutdown)
    pub kind: String,
    /// Only print this occurrence's wave gate and the rollout record
    #[arg(long)]
    pub status: bool,
    /// Followers: stop waiting for release after this many seconds
    #[arg(long, default_value_t = 900)]
    pub wait_secs: u64,
}

/// A wave is healthy once every member has written to the store within the
/// liveness window, i.e. came back after performing the action.
pub struct HeartbeatHealth {
    kernel: Kernel,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl HeartbeatHealth {
    pub fn new(kernel: Kernel, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            kernel,
            clock,
            window,
        }
    }
}

#[async_trait]
impl HealthCheck for HeartbeatHealth {
    async fn healthy(&self, wave: &CanaryWave) -> bool {
        let Ok(span) = chrono::Duration::from_std(self.window) else {
            return false;
        };
        let since = self.clock.now() - span;
        let seen = match self.kernel.blocking(move |k| k.recent_writers(since)).await {
            Ok(seen) => seen,
            Err(err) => {
                debug!(target: "cohort::node", error = %err, "health probe failed");
                return false;
            }
        };
        let missing = wave.members.iter().filter(|m| !seen.contains(*m)).count();
        debug!(target: "cohort::node", wave = %wave.name, missing, "wave heartbeat probe");
        missing == 0
    }
}

pub async fn run(node: Node, args: RolloutArgs) -> Result<()> {
    let canary = &node.coordination.canary;
    if args.status {
        let gate = canary.wave_gate(&args.kind, &node.ctx).await?;
        let record = canary.record(&gate.rollout_id).await?;
        return print_json(
            &serde_json::json!({ "gate": gate, "record": record }),
            true,
        );
    }

    let health = Arc::new(HeartbeatHealth::new(
        node.coordination.kernel.clone(),
        node.ctx.clock(),
        node.config.liveness_window(),
    ));
    let mut handle = canary.start_rollout(&args.kind, &node.ctx, health).await?;
    match handle.role().clone() {
        RolloutRole::Leader => {
            info!(target: "cohort::node", rollout = %handle.rollout_id(), "leading rollout");
            let token = handle.abort_token();
            let on_signal = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });
            let state = handle.join().await;
            on_signal.abort();
            let record = canary.record(handle.rollout_id()).await?;
            println!(
                "{} {}",
                handle.rollout_id(),
                state.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into())
            );
            if let Some(reason) = record.and_then(|r| r.reason) {
                println!("reason: {reason}");
            }
        }
        RolloutRole::Follower { leader } => {
            info!(target: "cohort::node", rollout = %handle.rollout_id(), %leader, "following rollout");
            let poll = canary.options().health_poll;
            let wait = async {
                loop {
                    let gate = canary.wave_gate(&args.kind, &node.ctx).await?;
                    if gate.released || gate.state.is_terminal() {
                        return anyhow::Ok(gate);
                    }
                    tokio::time::sleep(poll).await;
                }
            };
            let gate = tokio::time::timeout(Duration::from_secs(args.wait_secs), wait)
                .await
                .context("timed out waiting for this occurrence's wave")??;
            print_json(&gate, true)?;
        }
    }
    Ok(())
}
