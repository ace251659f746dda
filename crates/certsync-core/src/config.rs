//! Persisted configuration: the YAML document describing API credentials,
//! domains, output formats, SSH hosts and the sync schedule.
//!
//! The engine only ever reads snapshots of this model at the start of a
//! run; edits made mid-run apply to the next one.

use crate::error::ConfigError;
use crate::naming::{ArtifactRole, FormatKind, Separator};
use crate::schedule::validate_cron;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default)]
    pub api_key: String,
    /// Ciphertext produced by the credential vault; decrypted on demand.
    #[serde(default)]
    pub secret_key_encrypted: String,
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
}

pub fn default_api_base_url() -> String {
    "https://api.porkbun.com/api/json/v3".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub separator: Separator,
    /// Extra base names the artifact set is also written under, for
    /// consumers that expect different file names. Full duplicate writes,
    /// never symlinks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_file_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateSettings {
    pub output_dir: PathBuf,
    #[serde(default = "default_naming_format")]
    pub naming_format: String,
    #[serde(default = "default_formats")]
    pub formats: Vec<FormatKind>,
}

fn default_naming_format() -> String {
    "{domain}".to_string()
}

fn default_formats() -> Vec<FormatKind> {
    vec![FormatKind::Pem]
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("certificates"),
            naming_format: default_naming_format(),
            formats: default_formats(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshHostConfig {
    /// Unique key, also the sort key for deterministic distribution order.
    pub display_name: String,
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    /// Ciphertext produced by the credential vault. Plaintext passwords
    /// never touch the configuration file.
    pub password_encrypted: String,
    /// Remote directory the artifacts land in.
    pub cert_path: String,
    #[serde(default)]
    pub use_sudo: bool,
    /// Per-role remote file names overriding the local naming policy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_overrides: BTreeMap<ArtifactRole, String>,
    /// Accept whatever host key the server presents. On by default to keep
    /// fleet enrollment friction-free, at the cost of trust-on-every-use:
    /// a machine-in-the-middle presenting its own key is not detected.
    /// Turn off and pin `host_key_fingerprint` for the verified mode.
    #[serde(default = "default_true")]
    pub accept_unknown_host_keys: bool,
    /// Expected host key fingerprint (as printed by `ssh-keygen -l`).
    /// Required when `accept_unknown_host_keys` is off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cron")]
    pub cron: String,
}

fn default_cron() -> String {
    "0 2 * * *".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: default_cron(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
    #[serde(default)]
    pub certificates: CertificateSettings,
    #[serde(default)]
    pub ssh_hosts: Vec<SshHostConfig>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new(format!("reading {}: {e}", path.display())))?;
        let config: AppConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::new(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let contents = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::new(format!("serializing configuration: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::new(format!("creating {}: {e}", parent.display())))?;
        }
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::new(format!("writing {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.certificates.naming_format.contains("{domain}") {
            return Err(ConfigError::new(
                "certificates.naming_format must contain {domain}",
            ));
        }
        if self.certificates.formats.is_empty() {
            return Err(ConfigError::new("certificates.formats must not be empty"));
        }
        let unique_formats: BTreeSet<_> = self.certificates.formats.iter().collect();
        if unique_formats.len() != self.certificates.formats.len() {
            return Err(ConfigError::new("certificates.formats lists a format twice"));
        }

        let mut seen_domains = BTreeSet::new();
        for domain in &self.domains {
            if domain.domain.is_empty() {
                return Err(ConfigError::new("domain name must not be empty"));
            }
            if !seen_domains.insert(domain.domain.as_str()) {
                return Err(ConfigError::new(format!(
                    "duplicate domain {:?}",
                    domain.domain
                )));
            }
        }

        let mut seen_hosts = BTreeSet::new();
        for host in &self.ssh_hosts {
            if host.display_name.is_empty() {
                return Err(ConfigError::new("ssh host display_name must not be empty"));
            }
            if !seen_hosts.insert(host.display_name.as_str()) {
                return Err(ConfigError::new(format!(
                    "duplicate ssh host {:?}",
                    host.display_name
                )));
            }
            if host.hostname.is_empty() {
                return Err(ConfigError::new(format!(
                    "ssh host {:?} has no hostname",
                    host.display_name
                )));
            }
            if host.port == 0 {
                return Err(ConfigError::new(format!(
                    "ssh host {:?} has port 0",
                    host.display_name
                )));
            }
            if host.cert_path.is_empty() {
                return Err(ConfigError::new(format!(
                    "ssh host {:?} has no cert_path",
                    host.display_name
                )));
            }
            for (role, name) in &host.file_overrides {
                if name.is_empty() || name.contains('/') || name.contains('\\') {
                    return Err(ConfigError::new(format!(
                        "ssh host {:?}: override for {role} must be a bare file name",
                        host.display_name
                    )));
                }
            }
            if !host.accept_unknown_host_keys && host.host_key_fingerprint.is_none() {
                return Err(ConfigError::new(format!(
                    "ssh host {:?}: strict host key checking needs host_key_fingerprint",
                    host.display_name
                )));
            }
        }

        // Rejected at configuration time, never at fire time — a disabled
        // schedule must not hide a broken expression until someone flips it
        // on.
        validate_cron(&self.schedule.cron)?;
        Ok(())
    }

    /// Hosts in case-insensitive display-name order, the order every
    /// distribution pass uses.
    pub fn hosts_in_display_order(&self) -> Vec<&SshHostConfig> {
        let mut hosts: Vec<&SshHostConfig> = self.ssh_hosts.iter().collect();
        hosts.sort_by_key(|h| h.display_name.to_lowercase());
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
api:
  api_key: pk1_abc
  secret_key_encrypted: "c2VhbGVk"
domains:
  - domain: example.com
    custom_name: web
    separator: "-"
    alt_file_names: [legacy]
  - domain: internal.example.com
certificates:
  output_dir: /var/lib/certsync/certificates
  naming_format: "{domain}"
  formats: [pem, pfx]
ssh_hosts:
  - display_name: edge-1
    hostname: edge-1.example.com
    port: 22
    username: deploy
    password_encrypted: "c2VhbGVk"
    cert_path: /etc/ssl/private
    use_sudo: true
    file_overrides:
      fullchain: fullchain.pem
      privkey: privkey.pem
schedule:
  enabled: true
  cron: "0 2 * * *"
"#;

    #[test]
    fn parses_the_full_schema() {
        let config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.domains[0].separator, Separator::Dash);
        assert_eq!(config.domains[1].separator, Separator::Underscore);
        assert_eq!(config.certificates.formats, vec![FormatKind::Pem, FormatKind::Pfx]);
        let host = &config.ssh_hosts[0];
        assert!(host.accept_unknown_host_keys);
        assert_eq!(
            host.file_overrides.get(&ArtifactRole::Fullchain).unwrap(),
            "fullchain.pem"
        );
    }

    #[test]
    fn roundtrips_through_yaml() {
        let config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let rendered = serde_yaml::to_string(&config).unwrap();
        let reparsed: AppConfig = serde_yaml::from_str(&rendered).unwrap();
        reparsed.validate().unwrap();
        assert_eq!(reparsed.domains.len(), 2);
        assert_eq!(reparsed.schedule.cron, "0 2 * * *");
    }

    #[test]
    fn rejects_unknown_separator_and_override_role() {
        let bad_sep = SAMPLE.replace("separator: \"-\"", "separator: \"+\"");
        assert!(serde_yaml::from_str::<AppConfig>(&bad_sep).is_err());

        let bad_role = SAMPLE.replace("fullchain: fullchain.pem", "bundle: bundle.pem");
        assert!(serde_yaml::from_str::<AppConfig>(&bad_role).is_err());
    }

    #[test]
    fn rejects_invalid_cron_even_when_disabled() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.schedule.cron = "*/5 * * * *".into();
        assert!(config.validate().is_err());
        config.schedule.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicates() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.domains.push(config.domains[0].clone());
        assert!(config.validate().is_err());

        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.ssh_hosts.push(config.ssh_hosts[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn strict_host_keys_need_a_fingerprint() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.ssh_hosts[0].accept_unknown_host_keys = false;
        assert!(config.validate().is_err());
        config.ssh_hosts[0].host_key_fingerprint = Some("SHA256:abcdef".into());
        config.validate().unwrap();
    }

    #[test]
    fn hosts_sort_case_insensitively() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let mut second = config.ssh_hosts[0].clone();
        second.display_name = "Alpha".into();
        config.ssh_hosts.push(second);
        let order: Vec<&str> = config
            .hosts_in_display_order()
            .iter()
            .map(|h| h.display_name.as_str())
            .collect();
        assert_eq!(order, vec!["Alpha", "edge-1"]);
    }
}
