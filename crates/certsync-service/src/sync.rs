//! One full sync pass: fetch every configured domain, materialize the
//! artifacts, distribute to the fleet, record everything.
//!
//! Domains run sequentially — the issuing API rate-limits per account, so
//! fetches are deliberately not parallelized — and independently: one
//! domain failing never stops the others. The orchestrator reads one
//! configuration snapshot at run start, so edits made mid-run apply to the
//! next run only.

use certsync_core::config::{AppConfig, DomainConfig};
use certsync_core::error::{ApiError, ConfigError};
use certsync_core::event_log::EventLog;
use certsync_core::outcome::{DomainOutcome, SyncRun};
use certsync_core::vault::CredentialVault;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api_client::{ApiClient, CertificateFetcher};
use crate::convert::FormatConverter;
use crate::distribute::{DistributionEngine, HostTransport, SshTransport};

/// Reasons a run aborts before any domain work. Everything past this point
/// is captured per domain or per host instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The pre-run credential check failed.
    #[error("certificate API credential check failed: {0}")]
    Ping(#[source] ApiError),
}

pub struct SyncOrchestrator {
    config: Arc<RwLock<AppConfig>>,
    vault: Arc<CredentialVault>,
    event_log: Arc<EventLog>,
    transport: Arc<dyn HostTransport>,
    fetcher_override: Option<Arc<dyn CertificateFetcher>>,
    last_run: Mutex<Option<SyncRun>>,
}

impl SyncOrchestrator {
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        vault: Arc<CredentialVault>,
        event_log: Arc<EventLog>,
    ) -> Self {
        Self {
            config,
            vault,
            event_log,
            transport: Arc::new(SshTransport),
            fetcher_override: None,
            last_run: Mutex::new(None),
        }
    }

    /// Swap the network seams out. Tests use this to run the full pipeline
    /// against stubs.
    pub fn with_seams(
        config: Arc<RwLock<AppConfig>>,
        vault: Arc<CredentialVault>,
        event_log: Arc<EventLog>,
        transport: Arc<dyn HostTransport>,
        fetcher: Arc<dyn CertificateFetcher>,
    ) -> Self {
        Self {
            config,
            vault,
            event_log,
            transport,
            fetcher_override: Some(fetcher),
            last_run: Mutex::new(None),
        }
    }

    /// The most recent completed run, queryable at any time.
    pub fn last_run(&self) -> Option<SyncRun> {
        self.last_run.lock().clone()
    }

    /// Run the full pipeline across all configured domains.
    pub async fn run_all(&self) -> Result<SyncRun, RunError> {
        let config = self.config.read().clone();
        let fetcher = self.build_fetcher(&config)?;

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(run_id = %id, domains = config.domains.len(), "starting certificate sync");

        fetcher.ping().await.map_err(RunError::Ping)?;

        let converter = FormatConverter::new(&config.certificates.output_dir);
        let engine =
            DistributionEngine::with_transport(self.vault.clone(), self.transport.clone());

        let mut results = Vec::with_capacity(config.domains.len());
        for domain in &config.domains {
            results.push(
                self.sync_domain(fetcher.as_ref(), &converter, &engine, &config, domain)
                    .await,
            );
        }

        let run = SyncRun {
            id,
            started_at,
            finished_at: Utc::now(),
            results,
        };
        self.event_log.append_sync(&run);
        let succeeded = run
            .results
            .iter()
            .filter(|r| r.error.is_none())
            .count();
        info!(
            run_id = %id,
            succeeded,
            failed = run.results.len() - succeeded,
            "certificate sync finished"
        );
        *self.last_run.lock() = Some(run.clone());
        Ok(run)
    }

    fn build_fetcher(&self, config: &AppConfig) -> Result<Arc<dyn CertificateFetcher>, RunError> {
        if let Some(fetcher) = &self.fetcher_override {
            return Ok(fetcher.clone());
        }
        if config.api.api_key.is_empty() || config.api.secret_key_encrypted.is_empty() {
            return Err(ConfigError::new("API credentials not configured").into());
        }
        let secret = self
            .vault
            .decrypt_string(&config.api.secret_key_encrypted)
            .map_err(|e| ConfigError::new(format!("API secret: {e}")))?;
        Ok(Arc::new(ApiClient::new(
            config.api.base_url.clone(),
            config.api.api_key.clone(),
            secret,
        )))
    }

    async fn sync_domain(
        &self,
        fetcher: &dyn CertificateFetcher,
        converter: &FormatConverter,
        engine: &DistributionEngine,
        config: &AppConfig,
        domain: &DomainConfig,
    ) -> DomainOutcome {
        info!(domain = %domain.domain, "syncing certificate");
        let material = match fetcher.fetch(&domain.domain).await {
            Ok(material) => material,
            Err(e) => {
                warn!(domain = %domain.domain, error = %e, "fetch failed");
                return DomainOutcome::error(&domain.domain, e.to_string(), vec![]);
            }
        };

        let outcome = converter.write(
            domain,
            &material,
            &config.certificates.formats,
            &config.certificates.naming_format,
        );
        let files = outcome.file_names();

        if !outcome.failures.is_empty() {
            let detail = outcome
                .failures
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            warn!(domain = %domain.domain, error = %detail, "conversion failed");
            return DomainOutcome::error(&domain.domain, detail, files);
        }

        if !config.ssh_hosts.is_empty() {
            let bulk = engine
                .distribute_all(&domain.domain, &outcome.written, &config.ssh_hosts)
                .await;
            for attempt in &bulk.attempts {
                self.event_log.append_distribution(&domain.domain, attempt);
            }
            self.event_log.append_bulk(&bulk);
        }

        DomainOutcome::success(&domain.domain, files)
    }
}
