use anyhow::Result;
use clap::Args;

use super::node::Node;

#[derive(Args)]
pub struct CompleteArgs {
    /// Task id (as printed by `run`)
    pub task_id: String,
    /// Record the task as failed instead of completed
    #[arg(long)]
    pub failed: bool,
    /// Notes recorded with the outcome
    #[arg(long)]
    pub notes: Option<String>,
}

pub async fn complete(node: Node, args: CompleteArgs) -> Result<()> {
    let task = node
        .coordination
        .complete_task(&args.task_id, !args.failed, args.notes, &node.ctx)
        .await?;
    println!("{} {}", task.task_id, task.status);
    Ok(())
}
