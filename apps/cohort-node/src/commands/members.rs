use anyhow::Result;
use clap::Args;
use cohort_core::canary::wave_of;

use super::node::Node;
use super::print_json;

#[derive(Args)]
pub struct MembersArgs {
    /// Emit the canary waves as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(node: Node, args: MembersArgs) -> Result<()> {
    let waves = node.coordination.canary.waves(&node.ctx).await;
    if args.json {
        return print_json(&waves, true);
    }
    for wave in &waves {
        for member in &wave.members {
            let marker = if member == node.ctx.occurrence_id() { "*" } else { " " };
            println!("{marker} {:<24} {}", member.as_str(), wave.name);
        }
    }
    if let Some(mine) = wave_of(&waves, node.ctx.occurrence_id()) {
        println!("this occurrence rolls out in the {mine} wave");
    }
    Ok(())
}
