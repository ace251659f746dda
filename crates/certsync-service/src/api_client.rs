//! Client for the certificate-issuing API.
//!
//! The wire protocol is POST-with-JSON-credentials on every call: the
//! request body carries `apikey`/`secretapikey` and the response envelope
//! reports `status: SUCCESS` or an error message. The secret comes from the
//! credential vault and is never logged.

use async_trait::async_trait;
use certsync_core::error::ApiError;
use certsync_core::material::CertificateMaterial;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use zeroize::Zeroizing;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Seam between the orchestrator and the issuing service.
#[async_trait]
pub trait CertificateFetcher: Send + Sync {
    /// Credential check. Cheap; run once per sync pass before any domain
    /// work.
    async fn ping(&self) -> Result<(), ApiError>;

    /// Retrieve current certificate material for one domain.
    async fn fetch(&self, domain: &str) -> Result<CertificateMaterial, ApiError>;
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    secret_key: Zeroizing<String>,
}

impl ApiClient {
    pub fn new(base_url: String, api_key: String, secret_key: Zeroizing<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("certsync/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            secret_key,
        }
    }

    async fn call(&self, endpoint: &str) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let res = self
            .client
            .post(url)
            .json(&json!({
                "apikey": self.api_key,
                "secretapikey": *self.secret_key,
            }))
            .send()
            .await
            .map_err(|e| {
                // reqwest errors carry the URL but never the request body,
                // so the secret stays out of the message.
                ApiError::Transient(e.to_string())
            })?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Auth);
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ApiError::Transient(format!("HTTP {status}")));
        }
        Ok(res)
    }
}

fn envelope_status(body: &Value) -> Option<&str> {
    body.get("status").and_then(|s| s.as_str())
}

#[async_trait]
impl CertificateFetcher for ApiClient {
    async fn ping(&self) -> Result<(), ApiError> {
        let res = self.call("ping").await?;
        let body: Value = res
            .json()
            .await
            .map_err(|e| ApiError::Transient(format!("malformed ping response: {e}")))?;
        if envelope_status(&body) == Some("SUCCESS") {
            Ok(())
        } else {
            Err(ApiError::Auth)
        }
    }

    async fn fetch(&self, domain: &str) -> Result<CertificateMaterial, ApiError> {
        let res = self.call(&format!("ssl/retrieve/{domain}")).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(domain.to_string()));
        }
        let body: Value = res
            .json()
            .await
            .map_err(|e| ApiError::Transient(format!("malformed response: {e}")))?;
        if envelope_status(&body) != Some("SUCCESS") {
            let message = body
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("no detail");
            if message.to_lowercase().contains("api key") {
                return Err(ApiError::Auth);
            }
            return Err(ApiError::NotFound(domain.to_string()));
        }

        let field = |name: &str| {
            body.get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let material = CertificateMaterial {
            chain_pem: field("certificatechain"),
            leaf_pem: field("publickey"),
            key_pem: field("privatekey"),
        };
        if material.chain_pem.trim().is_empty() || material.key_pem.trim().is_empty() {
            return Err(ApiError::Transient(format!(
                "issuer returned no certificate material for {domain}"
            )));
        }
        Ok(material)
    }
}
