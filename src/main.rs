use anyhow::Result;
use clap::Parser;
use tracing::debug;

mod cli;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries only indicator output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "usagebar=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    let mut config = usagebar::config::load_or_default(args.config.as_deref())?;
    config.apply_env_overrides();
    debug!(path = %config.credentials_path().display(), "Resolved credential path");

    match args.command {
        Command::Run { interval } => cli::run(&config, interval).await,
        Command::Login {
            session_key,
            org_id,
        } => cli::login(&config, session_key, org_id).await,
        Command::Logout => cli::logout(&config),
        Command::Status => cli::status(&config).await,
    }
}
