use anyhow::{anyhow, Result};
use certsync_core::event_log::EventKind;
use certsync_core::schedule::CronSchedule;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

use certsync_service::scheduler::{self, TriggerError};
use certsync_service::state::ServiceState;

#[derive(Parser, Debug)]
#[command(author, version, about = "Certificate sync & distribution service", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the service: scheduled syncs until interrupted.
    Run,
    /// Trigger one sync pass now and print the result.
    Sync,
    /// Print the most recent sync run.
    Status,
    /// Print event log entries, newest first.
    Logs {
        /// certificate_sync, certificate_distribution or bulk_distribution
        #[arg(long)]
        event_type: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Print aggregate sync/distribution statistics.
    Stats,
    /// Encrypt a secret read from stdin for use in the configuration file.
    Encrypt,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run => run_command(cli.config).await,
        Commands::Sync => sync_command(cli.config).await,
        Commands::Status => status_command(cli.config),
        Commands::Logs { event_type, limit } => logs_command(cli.config, event_type, limit),
        Commands::Stats => stats_command(cli.config),
        Commands::Encrypt => encrypt_command(),
    }
}

async fn run_command(config_path: Option<PathBuf>) -> Result<()> {
    let state = ServiceState::initialize(config_path)?;

    let schedule = {
        let config = state.config.read();
        if !config.schedule.enabled {
            None
        } else {
            // Validated when the configuration was accepted; parse again to
            // get the compiled form.
            Some(config.schedule.cron.parse::<CronSchedule>()?)
        }
    };

    let scheduler_task = match schedule {
        Some(schedule) => {
            let (task, handle) = scheduler::spawn_scheduler(
                schedule,
                state.orchestrator.clone(),
                state.run_token.clone(),
            );
            Some((task, handle))
        }
        None => {
            warn!("schedule is disabled; only manual syncs will run");
            None
        }
    };

    info!("service started");
    signal::ctrl_c().await?;
    info!("service stopping");
    if let Some((task, handle)) = scheduler_task {
        handle.shutdown();
        task.abort();
    }
    Ok(())
}

async fn sync_command(config_path: Option<PathBuf>) -> Result<()> {
    let state = ServiceState::initialize(config_path)?;
    match scheduler::trigger_sync(&state.orchestrator, &state.run_token).await {
        Ok(run) => {
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(())
        }
        Err(TriggerError::Busy) => Err(anyhow!("a sync run is already in progress")),
        Err(TriggerError::Run(e)) => Err(e.into()),
    }
}

fn status_command(config_path: Option<PathBuf>) -> Result<()> {
    let state = ServiceState::initialize(config_path)?;
    let mut entries = state
        .event_log
        .query(Some(EventKind::CertificateSync), Some(1))?;
    match entries.pop() {
        Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
        None => println!("no sync has run yet"),
    }
    Ok(())
}

fn logs_command(
    config_path: Option<PathBuf>,
    event_type: Option<String>,
    limit: usize,
) -> Result<()> {
    let state = ServiceState::initialize(config_path)?;
    let kind = event_type
        .map(|raw| raw.parse::<EventKind>())
        .transpose()
        .map_err(|e| anyhow!(e))?;
    let entries = state.event_log.query(kind, Some(limit))?;
    for entry in entries {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

fn stats_command(config_path: Option<PathBuf>) -> Result<()> {
    let state = ServiceState::initialize(config_path)?;
    let stats = state.event_log.stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn encrypt_command() -> Result<()> {
    // Only the vault is needed here; this is how secrets get sealed before
    // they ever appear in the configuration file.
    let vault = certsync_core::vault::CredentialVault::open(&certsync_core::paths::vault_key_file()?)?;
    let mut plaintext = String::new();
    std::io::stdin().read_to_string(&mut plaintext)?;
    let plaintext = plaintext.trim_end_matches('\n');
    if plaintext.is_empty() {
        return Err(anyhow!("nothing to encrypt on stdin"));
    }
    println!("{}", vault.encrypt(plaintext.as_bytes())?);
    Ok(())
}
