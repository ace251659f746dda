//! Error taxonomy shared across the sync and distribution pipeline.
//!
//! Per-domain and per-host failures are captured into result records and
//! logged; they never abort sibling work. Only configuration problems stop
//! a run before it starts.

use crate::naming::{ArtifactRole, FormatKind};
use thiserror::Error;

/// Malformed or missing settings. Surfaced to the caller before any work
/// runs; never raised mid-run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failures talking to the certificate-issuing API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Credentials rejected. Not retryable.
    #[error("certificate API rejected the configured credentials")]
    Auth,
    /// The domain is not registered with the issuer. Not retryable.
    #[error("domain {0} is not known to the certificate API")]
    NotFound(String),
    /// Network trouble, rate limiting or server-side failure. The next
    /// scheduled sync is the retry.
    #[error("transient certificate API failure: {0}")]
    Transient(String),
}

/// Failures in the credential vault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("credential vault unavailable: {0}")]
    Unavailable(String),
    /// Wrong key or corrupt ciphertext. Never degrades to plaintext.
    #[error("decryption failed: encryption key mismatch or corrupt ciphertext")]
    Decryption,
}

/// A single format failing conversion or write. Sibling formats still run.
#[derive(Debug, Error)]
#[error("writing {format} artifact for role {role}: {cause}")]
pub struct ConvertError {
    pub format: FormatKind,
    pub role: ArtifactRole,
    pub cause: String,
}

/// Per-host distribution failures. A host failing terminates only its own
/// attempt; the engine moves on to the next host.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("connecting to {host}: {detail}")]
    Connection { host: String, detail: String },
    #[error("authentication failed for {username}@{host}")]
    Auth { host: String, username: String },
    #[error("permission denied writing {path} on {host}; set use_sudo for this host if the path needs elevation")]
    Permission { host: String, path: String },
    #[error("transfer to {host} failed: {detail}")]
    Transfer { host: String, detail: String },
}

impl SshError {
    /// The host this error belongs to, for per-host result records.
    pub fn host(&self) -> &str {
        match self {
            SshError::Connection { host, .. }
            | SshError::Auth { host, .. }
            | SshError::Permission { host, .. }
            | SshError::Transfer { host, .. } => host,
        }
    }
}
