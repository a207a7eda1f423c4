//! Headless host: command-line front end over the polling controller and
//! the manual-entry path of the extraction flow.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use usagebar::credentials::{CredentialStore, SecretCodec};
use usagebar::extraction::{CredentialSink, ExtractionFlow};
use usagebar::polling::{PollingController, PollingEvent};
use usagebar::usage::display::format_time_until;
use usagebar::usage::UsageClient;
use usagebar::{UsageBarConfig, UsageError};

#[derive(Parser)]
#[command(name = "usagebar")]
#[command(about = "Polls provider usage limits and prints a compact indicator")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Poll continuously and print the indicator whenever it changes
    Run {
        /// Refresh interval in seconds (clamped to the configured bounds)
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Store a session key (read from stdin when omitted)
    Login {
        #[arg(long)]
        session_key: Option<String>,

        /// Organization id (resolved from the session when omitted)
        #[arg(long)]
        org_id: Option<String>,
    },
    /// Remove stored credentials
    Logout,
    /// Refresh once and print the current usage
    Status,
}

fn open_store(config: &UsageBarConfig) -> Arc<CredentialStore> {
    let codec = SecretCodec::for_this_machine();
    if codec.is_reduced_security() {
        warn!("Credentials are protected by a constant fallback key on this machine");
    }
    Arc::new(CredentialStore::open(config.credentials_path(), codec))
}

fn build_controller(
    config: &UsageBarConfig,
    client: UsageClient,
) -> Arc<PollingController> {
    Arc::new(PollingController::new(
        open_store(config),
        Arc::new(client),
        config.polling.clone(),
    ))
}

/// `usagebar run`
pub async fn run(config: &UsageBarConfig, interval: Option<u64>) -> Result<()> {
    let controller = build_controller(config, UsageClient::new(&config.provider)?);
    let mode = config.display.mode;
    let mut events = controller.subscribe();

    match interval {
        Some(seconds) => {
            controller.set_interval(seconds);
        }
        None => controller.start_auto_refresh(),
    }
    info!(
        interval_seconds = controller.interval_seconds(),
        "Polling started, press Ctrl-C to stop"
    );

    let mut last_line = controller.indicator_text(mode);
    println!("{}", last_line);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(PollingEvent::FetchFailed(UsageError::Unauthorized)) => {
                        warn!("Session expired, run `usagebar login` to sign in again");
                    }
                    Ok(event) => debug!(?event, "Polling event"),
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "Missed polling events"),
                    Err(RecvError::Closed) => break,
                }

                let line = controller.indicator_text(mode);
                if line != last_line {
                    println!("{}", line);
                    last_line = line;
                }
            }
        }
    }

    controller.shutdown();
    Ok(())
}

/// `usagebar login`
pub async fn login(
    config: &UsageBarConfig,
    session_key: Option<String>,
    org_id: Option<String>,
) -> Result<()> {
    let session_key = match session_key {
        Some(key) => key,
        None => prompt("Session key: ").await?,
    };
    if session_key.trim().is_empty() {
        bail!("A session key is required");
    }

    let client = UsageClient::new(&config.provider)?;
    let org_id = match org_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => client
            .resolve_organization(&session_key)
            .await
            .context("Could not determine the organization id, pass --org-id")?,
    };

    let controller = build_controller(config, client);
    let sink: Arc<dyn CredentialSink> = controller.clone();
    let flow = ExtractionFlow::new(config.extraction.clone(), None, sink);
    flow.submit_manual(&session_key, &org_id).await?;

    let state = controller.state();
    match &state.last_error {
        None => println!(
            "Signed in. {}",
            controller.indicator_text(config.display.mode)
        ),
        Some(UsageError::Unauthorized) => {
            println!("Credentials saved, but the provider rejected the session key")
        }
        Some(err) => println!("Credentials saved. First refresh failed: {}", err),
    }
    Ok(())
}

/// `usagebar logout`
pub fn logout(config: &UsageBarConfig) -> Result<()> {
    open_store(config).clear()?;
    println!("Signed out");
    Ok(())
}

/// `usagebar status`
pub async fn status(config: &UsageBarConfig) -> Result<()> {
    let controller = build_controller(config, UsageClient::new(&config.provider)?);
    controller.refresh().await;

    let state = controller.state();
    let now = Utc::now();

    println!("{}", controller.indicator_text(config.display.mode));
    if state.last_updated.is_some() {
        println!(
            "5-hour: {:>3}%  resets in {}",
            state.snapshot.five_hour.percent(),
            format_time_until(state.snapshot.five_hour.resets_at, now)
        );
        println!(
            "7-day:  {:>3}%  resets in {}",
            state.snapshot.seven_day.percent(),
            format_time_until(state.snapshot.seven_day.resets_at, now)
        );
    }
    if let Some(err) = &state.last_error {
        println!("Error: {}", err);
        if state.needs_reauthentication() {
            println!("Run `usagebar login` to sign in again");
        }
    }
    Ok(())
}

async fn prompt(label: &str) -> Result<String> {
    eprint!("{}", label);

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read from stdin")?;
    Ok(line.trim().to_string())
}
