use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::node::NodeArgs;
use commands::{members, rollout, run, schema, tasks, tickets};

#[derive(Parser)]
#[command(
    name = "cohort-node",
    version,
    about = "Run one coordination occurrence and inspect the shared store"
)]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run discovery rounds until interrupted
    Run(run::RunArgs),
    /// Submit a new ticket (starts PENDING and shared)
    Submit(tickets::SubmitArgs),
    /// List tickets
    Tickets(tickets::TicketsArgs),
    /// Move a ticket to another status
    Transition(tickets::TransitionArgs),
    /// Close an ACTIVE task as completed or failed
    Complete(tasks::CompleteArgs),
    /// Start or follow today's canary rollout of an action
    Rollout(rollout::RolloutArgs),
    /// Print current members and their canary waves
    Members(members::MembersArgs),
    /// Print or write the config JSON schema
    Schema(schema::SchemaArgs),
}

#[tokio::main]
async fn main() {
    cohort_otel::init();
    let cli = Cli::parse();
    if let Err(err) = dispatch(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Schema(args) => schema::run(args),
        Commands::Run(args) => run::run(cli.node.open()?, args).await,
        Commands::Submit(args) => tickets::submit(cli.node.open()?, args).await,
        Commands::Tickets(args) => tickets::list(cli.node.open()?, args).await,
        Commands::Transition(args) => tickets::transition(cli.node.open()?, args).await,
        Commands::Complete(args) => tasks::complete(cli.node.open()?, args).await,
        Commands::Rollout(args) => rollout::run(cli.node.open()?, args).await,
        Commands::Members(args) => members::run(cli.node.open()?, args).await,
    }
}
