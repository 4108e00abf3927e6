//! countdown-sw: command-line host for the countdown offline worker

use clap::Parser;
use countdown_core::{init_logging, LogConfig};

mod cli;
mod commands;

use cli::{Cli, Commands};
use commands::Context;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format))?;

    let ctx = Context::load(&cli).await?;

    match cli.command {
        Commands::Install => commands::install(&ctx).await,
        Commands::Fetch {
            ref target,
            navigate,
            ref method,
        } => commands::fetch(&ctx, target, navigate, method).await,
        Commands::Sync { ref tag } => commands::sync(&ctx, tag.as_deref()).await,
        Commands::Push { ref payload } => commands::push(&ctx, payload.as_deref()).await,
        Commands::Message { ref kind, ref data } => {
            commands::message(&ctx, kind, data.as_deref()).await
        }
        Commands::Status => commands::status(&ctx).await,
    }
}
