//! Shared service wiring: configuration handle, vault, event log,
//! orchestrator and the run token, assembled once at startup.

use anyhow::{Context, Result};
use certsync_core::config::AppConfig;
use certsync_core::event_log::EventLog;
use certsync_core::paths;
use certsync_core::vault::CredentialVault;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::scheduler::RunToken;
use crate::sync::SyncOrchestrator;

pub struct ServiceState {
    pub config: Arc<RwLock<AppConfig>>,
    pub vault: Arc<CredentialVault>,
    pub event_log: Arc<EventLog>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub run_token: RunToken,
}

impl ServiceState {
    /// Load configuration, open the vault and wire the pipeline together.
    pub fn initialize(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => paths::config_file()?,
        };
        let config = AppConfig::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        info!(
            path = %config_path.display(),
            domains = config.domains.len(),
            hosts = config.ssh_hosts.len(),
            "configuration loaded"
        );
        let config = Arc::new(RwLock::new(config));

        let vault = Arc::new(CredentialVault::open(&paths::vault_key_file()?)?);
        let event_log = Arc::new(EventLog::new(paths::event_log_file()?));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            config.clone(),
            vault.clone(),
            event_log.clone(),
        ));

        Ok(Self {
            config,
            vault,
            event_log,
            orchestrator,
            run_token: RunToken::new(),
        })
    }
}
