// chat-rag/crates/chat-rag/src/main.rs

#[cfg(feature = "cli")]
use chat_rag::{config::Config, run_server, server::build_state, telemetry::init_tracing};
#[cfg(feature = "cli")]
use clap::{Args, Parser, Subcommand};
#[cfg(feature = "cli")]
use dotenvy::dotenv;

#[cfg(feature = "cli")]
#[derive(Parser, Debug)]
#[command(name = "chat-rag", version, about = "Grounded answers over chat history")]
struct Cli {
    /// Defaults to `serve`
    #[command(subcommand)]
    command: Option<Commands>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API
    Serve,
    /// Embed historical messages, then exit
    Backfill(BackfillArgs),
    /// Retry embeddings left pending by an interrupted write, then exit
    Reconcile,
}

#[cfg(feature = "cli")]
#[derive(Args, Debug)]
struct BackfillArgs {
    /// Only messages with an id greater than this one
    #[arg(long, conflicts_with = "from_checkpoint")]
    resume_from: Option<String>,

    /// Continue after the last completed page of a previous run
    #[arg(long, default_value_t = false)]
    from_checkpoint: bool,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(cfg).await,
        Commands::Backfill(args) => {
            let state = build_state(cfg).await?;
            let report = |stats: &chat_rag::BackfillStats| {
                tracing::info!(
                    "{}/{} embedded, {} failed, {} skipped",
                    stats.completed, stats.total, stats.failed, stats.skipped
                );
            };
            let stats = if args.from_checkpoint {
                state.backfill.process_from_checkpoint(Some(&report)).await?
            } else {
                state.backfill.process(args.resume_from.as_deref(), Some(&report)).await?
            };
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Reconcile => {
            let state = build_state(cfg).await?;
            let stats = state.backfill.reconcile_pending().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
