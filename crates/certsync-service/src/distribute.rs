//! Pushes a domain's artifact set to the configured fleet over SSH.
//!
//! Hosts are processed in display-name order and in isolation: a host that
//! cannot be reached, authenticated against or written to fails alone, and
//! the engine carries on with the next one. Nothing is retried within a
//! run; the next scheduled sync is the retry.
//!
//! Transfers ride the SFTP subsystem. For hosts that need elevation the
//! file is staged under /tmp and moved into place with `sudo -S`, the
//! password fed on stdin over a PTY, mirroring what an operator would do
//! by hand.

use async_trait::async_trait;
use certsync_core::config::SshHostConfig;
use certsync_core::error::SshError;
use certsync_core::naming::FormatKind;
use certsync_core::outcome::{BulkDistribution, DistributionAttempt};
use certsync_core::vault::CredentialVault;
use russh::{client, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::convert::ArtifactFile;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Hard ceiling on one host's whole distribution. A wedged transfer counts
/// as that host failing, not the run hanging.
pub const HOST_DEADLINE: Duration = Duration::from_secs(300);

/// An artifact with its destination name resolved for one host.
#[derive(Debug, Clone)]
pub struct RemoteArtifact {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Result of one host push: what landed, and the error that stopped it,
/// if any.
#[derive(Debug, Default)]
pub struct PushOutcome {
    pub files: Vec<String>,
    pub error: Option<SshError>,
}

impl PushOutcome {
    fn failed(error: SshError) -> Self {
        Self {
            files: vec![],
            error: Some(error),
        }
    }
}

/// Seam between the engine and the wire, so the isolation and aggregation
/// logic is testable without a fleet.
#[async_trait]
pub trait HostTransport: Send + Sync {
    async fn push(
        &self,
        host: &SshHostConfig,
        password: &str,
        artifacts: &[RemoteArtifact],
    ) -> PushOutcome;
}

pub struct DistributionEngine {
    vault: Arc<CredentialVault>,
    transport: Arc<dyn HostTransport>,
}

impl DistributionEngine {
    pub fn new(vault: Arc<CredentialVault>) -> Self {
        Self::with_transport(vault, Arc::new(SshTransport))
    }

    pub fn with_transport(vault: Arc<CredentialVault>, transport: Arc<dyn HostTransport>) -> Self {
        Self { vault, transport }
    }

    /// Push `artifacts` to every host, in display-name order, isolating
    /// failures per host.
    pub async fn distribute_all(
        &self,
        domain: &str,
        artifacts: &[ArtifactFile],
        hosts: &[SshHostConfig],
    ) -> BulkDistribution {
        let mut sorted: Vec<&SshHostConfig> = hosts.iter().collect();
        sorted.sort_by_key(|h| h.display_name.to_lowercase());

        let mut attempts = Vec::with_capacity(sorted.len());
        for host in sorted {
            attempts.push(self.distribute_to_host(domain, artifacts, host).await);
        }
        let bulk = BulkDistribution::from_attempts(domain, attempts);
        info!(
            domain,
            total = bulk.total_hosts,
            successful = bulk.successful,
            failed = bulk.failed,
            "distribution finished"
        );
        bulk
    }

    async fn distribute_to_host(
        &self,
        domain: &str,
        artifacts: &[ArtifactFile],
        host: &SshHostConfig,
    ) -> DistributionAttempt {
        info!(domain, host = %host.display_name, hostname = %host.hostname, "distributing");
        let password = match self.vault.decrypt_string(&host.password_encrypted) {
            Ok(password) => password,
            Err(e) => {
                warn!(host = %host.display_name, error = %e, "cannot decrypt host password");
                return DistributionAttempt::failed(&host.display_name, e.to_string(), vec![]);
            }
        };

        let remote: Vec<RemoteArtifact> = artifacts
            .iter()
            .map(|artifact| RemoteArtifact {
                file_name: remote_file_name(host, artifact),
                bytes: artifact.bytes.clone(),
            })
            .collect();

        let outcome =
            match tokio::time::timeout(HOST_DEADLINE, self.transport.push(host, &password, &remote))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => PushOutcome::failed(SshError::Transfer {
                    host: host.display_name.clone(),
                    detail: format!("deadline of {}s exceeded", HOST_DEADLINE.as_secs()),
                }),
            };

        match outcome.error {
            None => {
                info!(host = %host.display_name, files = outcome.files.len(), "distribution succeeded");
                DistributionAttempt::success(&host.display_name, outcome.files)
            }
            Some(e) => {
                warn!(host = %host.display_name, error = %e, "distribution failed");
                DistributionAttempt::failed(&host.display_name, e.to_string(), outcome.files)
            }
        }
    }
}

/// Destination name for one artifact on one host: the configured role
/// override when there is one, the local naming policy otherwise. Overrides
/// apply to the PEM role files only; single-file formats keep their names.
pub fn remote_file_name(host: &SshHostConfig, artifact: &ArtifactFile) -> String {
    if artifact.format == FormatKind::Pem {
        if let Some(name) = host.file_overrides.get(&artifact.role) {
            return name.clone();
        }
    }
    artifact.file_name.clone()
}

// ── SSH transport ───────────────────────────────────────────────────────────

struct HostKeyCheck {
    display_name: String,
    accept_unknown: bool,
    pinned_fingerprint: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if let Some(expected) = &self.pinned_fingerprint {
            let actual = server_public_key.fingerprint();
            if &actual == expected || format!("SHA256:{actual}") == *expected {
                return Ok(true);
            }
            warn!(host = %self.display_name, fingerprint = %actual, "host key does not match pinned fingerprint");
            return Ok(false);
        }
        if self.accept_unknown {
            return Ok(true);
        }
        warn!(host = %self.display_name, "unknown host key rejected; pin a fingerprint or allow unknown keys");
        Ok(false)
    }
}

pub struct SshTransport;

#[async_trait]
impl HostTransport for SshTransport {
    async fn push(
        &self,
        host: &SshHostConfig,
        password: &str,
        artifacts: &[RemoteArtifact],
    ) -> PushOutcome {
        let handle = match self.connect(host, password).await {
            Ok(handle) => handle,
            Err(e) => return PushOutcome::failed(e),
        };
        let outcome = self.push_over(&handle, host, password, artifacts).await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            // The files are already on the remote side; a noisy teardown is
            // not a failed distribution.
            if outcome.error.is_none() {
                warn!(host = %host.display_name, error = %e, "ssh teardown failed");
            }
        }
        outcome
    }
}

impl SshTransport {
    async fn connect(
        &self,
        host: &SshHostConfig,
        password: &str,
    ) -> Result<client::Handle<HostKeyCheck>, SshError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(SESSION_IDLE_TIMEOUT),
            ..Default::default()
        });
        let checker = HostKeyCheck {
            display_name: host.display_name.clone(),
            accept_unknown: host.accept_unknown_host_keys,
            pinned_fingerprint: host.host_key_fingerprint.clone(),
        };
        let connecting = client::connect(config, (host.hostname.as_str(), host.port), checker);
        let handle = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| SshError::Connection {
                host: host.display_name.clone(),
                detail: format!("timed out after {}s", CONNECT_TIMEOUT.as_secs()),
            })?
            .map_err(|e| SshError::Connection {
                host: host.display_name.clone(),
                detail: e.to_string(),
            })?;

        let mut handle = handle;
        let authenticated = handle
            .authenticate_password(&host.username, password)
            .await
            .map_err(|e| SshError::Connection {
                host: host.display_name.clone(),
                detail: e.to_string(),
            })?;
        if !authenticated {
            return Err(SshError::Auth {
                host: host.display_name.clone(),
                username: host.username.clone(),
            });
        }
        Ok(handle)
    }

    async fn push_over(
        &self,
        handle: &client::Handle<HostKeyCheck>,
        host: &SshHostConfig,
        password: &str,
        artifacts: &[RemoteArtifact],
    ) -> PushOutcome {
        let sftp = match self.open_sftp(handle, host).await {
            Ok(sftp) => sftp,
            Err(e) => return PushOutcome::failed(e),
        };

        if let Err(e) = self.ensure_remote_dir(handle, &sftp, host, password).await {
            return PushOutcome::failed(e);
        }

        let mut done: Vec<String> = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let result = if host.use_sudo {
                self.upload_with_sudo(handle, &sftp, host, password, artifact)
                    .await
            } else {
                self.upload_direct(&sftp, host, artifact).await
            };
            match result {
                Ok(()) => done.push(artifact.file_name.clone()),
                Err(e) => {
                    return PushOutcome {
                        files: done,
                        error: Some(e),
                    }
                }
            }
        }
        PushOutcome {
            files: done,
            error: None,
        }
    }

    async fn open_sftp(
        &self,
        handle: &client::Handle<HostKeyCheck>,
        host: &SshHostConfig,
    ) -> Result<SftpSession, SshError> {
        let channel = handle.channel_open_session().await.map_err(|e| {
            SshError::Connection {
                host: host.display_name.clone(),
                detail: e.to_string(),
            }
        })?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::Connection {
                host: host.display_name.clone(),
                detail: format!("sftp subsystem: {e}"),
            })?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Connection {
                host: host.display_name.clone(),
                detail: format!("sftp handshake: {e}"),
            })
    }

    async fn ensure_remote_dir(
        &self,
        handle: &client::Handle<HostKeyCheck>,
        sftp: &SftpSession,
        host: &SshHostConfig,
        password: &str,
    ) -> Result<(), SshError> {
        if host.use_sudo {
            self.exec_sudo(
                handle,
                host,
                password,
                &format!("mkdir -p '{0}' && chmod 755 '{0}'", host.cert_path),
            )
            .await?;
            return Ok(());
        }

        // mkdir -p over SFTP: walk the components, creating what is missing.
        let mut current = String::new();
        for component in host.cert_path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            if sftp.metadata(current.clone()).await.is_ok() {
                continue;
            }
            sftp.create_dir(current.clone()).await.map_err(|e| {
                if is_permission_denied(&e) {
                    SshError::Permission {
                        host: host.display_name.clone(),
                        path: host.cert_path.clone(),
                    }
                } else {
                    SshError::Transfer {
                        host: host.display_name.clone(),
                        detail: format!("mkdir {current}: {e}"),
                    }
                }
            })?;
        }
        Ok(())
    }

    async fn upload_direct(
        &self,
        sftp: &SftpSession,
        host: &SshHostConfig,
        artifact: &RemoteArtifact,
    ) -> Result<(), SshError> {
        let remote_path = join_remote(&host.cert_path, &artifact.file_name);
        let mut file = sftp.create(remote_path.clone()).await.map_err(|e| {
            if is_permission_denied(&e) {
                SshError::Permission {
                    host: host.display_name.clone(),
                    path: remote_path.clone(),
                }
            } else {
                SshError::Transfer {
                    host: host.display_name.clone(),
                    detail: format!("create {remote_path}: {e}"),
                }
            }
        })?;
        file.write_all(&artifact.bytes)
            .await
            .map_err(|e| SshError::Transfer {
                host: host.display_name.clone(),
                detail: format!("write {remote_path}: {e}"),
            })?;
        file.shutdown().await.map_err(|e| SshError::Transfer {
            host: host.display_name.clone(),
            detail: format!("close {remote_path}: {e}"),
        })?;
        Ok(())
    }

    async fn upload_with_sudo(
        &self,
        handle: &client::Handle<HostKeyCheck>,
        sftp: &SftpSession,
        host: &SshHostConfig,
        password: &str,
        artifact: &RemoteArtifact,
    ) -> Result<(), SshError> {
        // Stage where the login user can always write, then move into place
        // with elevation.
        let staged = format!("/tmp/{}", artifact.file_name);
        let remote_path = join_remote(&host.cert_path, &artifact.file_name);

        let mut file = sftp
            .create(staged.clone())
            .await
            .map_err(|e| SshError::Transfer {
                host: host.display_name.clone(),
                detail: format!("stage {staged}: {e}"),
            })?;
        file.write_all(&artifact.bytes)
            .await
            .map_err(|e| SshError::Transfer {
                host: host.display_name.clone(),
                detail: format!("write {staged}: {e}"),
            })?;
        file.shutdown().await.map_err(|e| SshError::Transfer {
            host: host.display_name.clone(),
            detail: format!("close {staged}: {e}"),
        })?;

        self.exec_sudo(
            handle,
            host,
            password,
            &format!("mv '{staged}' '{remote_path}' && chmod 644 '{remote_path}'"),
        )
        .await
    }

    async fn exec_sudo(
        &self,
        handle: &client::Handle<HostKeyCheck>,
        host: &SshHostConfig,
        password: &str,
        command: &str,
    ) -> Result<(), SshError> {
        let mut channel = handle.channel_open_session().await.map_err(|e| {
            SshError::Connection {
                host: host.display_name.clone(),
                detail: e.to_string(),
            }
        })?;
        // sudo insists on a terminal on many default configurations.
        channel
            .request_pty(false, "dumb", 80, 24, 0, 0, &[])
            .await
            .map_err(|e| SshError::Transfer {
                host: host.display_name.clone(),
                detail: format!("request pty: {e}"),
            })?;
        channel
            .exec(true, format!("sudo -S -p '' sh -c \"{command}\""))
            .await
            .map_err(|e| SshError::Transfer {
                host: host.display_name.clone(),
                detail: format!("exec: {e}"),
            })?;
        channel
            .data(format!("{password}\n").as_bytes())
            .await
            .map_err(|e| SshError::Transfer {
                host: host.display_name.clone(),
                detail: format!("send sudo password: {e}"),
            })?;
        channel.eof().await.map_err(|e| SshError::Transfer {
            host: host.display_name.clone(),
            detail: format!("eof: {e}"),
        })?;

        let mut exit_status: Option<u32> = None;
        let mut output = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }
        match exit_status {
            Some(0) => Ok(()),
            status => {
                let detail = String::from_utf8_lossy(&output);
                let detail = detail.trim();
                if detail.to_lowercase().contains("permission denied") {
                    Err(SshError::Permission {
                        host: host.display_name.clone(),
                        path: host.cert_path.clone(),
                    })
                } else {
                    Err(SshError::Transfer {
                        host: host.display_name.clone(),
                        detail: format!(
                            "sudo command exited with {status:?}: {detail}"
                        ),
                    })
                }
            }
        }
    }
}

fn join_remote(dir: &str, file_name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), file_name)
}

fn is_permission_denied(error: &russh_sftp::client::error::Error) -> bool {
    matches!(
        error,
        russh_sftp::client::error::Error::Status(status)
            if status.status_code == StatusCode::PermissionDenied
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use certsync_core::naming::ArtifactRole;
    use std::collections::BTreeMap;

    fn host_with_overrides(overrides: BTreeMap<ArtifactRole, String>) -> SshHostConfig {
        SshHostConfig {
            display_name: "edge-1".into(),
            hostname: "edge-1.example.com".into(),
            port: 22,
            username: "deploy".into(),
            password_encrypted: "sealed".into(),
            cert_path: "/etc/ssl/private".into(),
            use_sudo: false,
            file_overrides: overrides,
            accept_unknown_host_keys: true,
            host_key_fingerprint: None,
        }
    }

    fn artifact(role: ArtifactRole, format: FormatKind, name: &str) -> ArtifactFile {
        ArtifactFile {
            role,
            format,
            file_name: name.into(),
            bytes: vec![],
        }
    }

    #[test]
    fn overrides_rename_pem_roles_only() {
        let mut overrides = BTreeMap::new();
        overrides.insert(ArtifactRole::Fullchain, "fullchain.pem".to_string());
        overrides.insert(ArtifactRole::Privkey, "privkey.pem".to_string());
        let host = host_with_overrides(overrides);

        let fullchain = artifact(
            ArtifactRole::Fullchain,
            FormatKind::Pem,
            "example.com_fullchain.pem",
        );
        assert_eq!(remote_file_name(&host, &fullchain), "fullchain.pem");

        let cert = artifact(ArtifactRole::Cert, FormatKind::Pem, "example.com_cert.pem");
        assert_eq!(remote_file_name(&host, &cert), "example.com_cert.pem");

        // A .pfx bundle keeps its name even though it is filed under the
        // fullchain role.
        let pfx = artifact(ArtifactRole::Fullchain, FormatKind::Pfx, "example.com.pfx");
        assert_eq!(remote_file_name(&host, &pfx), "example.com.pfx");
    }

    #[test]
    fn remote_paths_join_cleanly() {
        assert_eq!(
            join_remote("/etc/ssl/private/", "a.pem"),
            "/etc/ssl/private/a.pem"
        );
        assert_eq!(
            join_remote("/etc/ssl/private", "a.pem"),
            "/etc/ssl/private/a.pem"
        );
    }
}
