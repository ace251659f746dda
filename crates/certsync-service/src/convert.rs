//! Materializes fetched certificate material as artifact files on disk.
//!
//! PEM, CRT and KEY treat the material as opaque text, exactly as the
//! issuer returned it; only PFX parses it (openssl) to build the PKCS#12
//! bundle. Every file is staged to a temp file in the output directory and
//! persisted to its final name afterwards, so a crash mid-write never
//! leaves a half-written certificate or key readable at its final path.

use certsync_core::config::DomainConfig;
use certsync_core::error::ConvertError;
use certsync_core::material::CertificateMaterial;
use certsync_core::naming::{self, ArtifactRole, FormatKind, Separator};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::x509::X509;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, info};

const PEM_CERT_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_CERT_END: &str = "-----END CERTIFICATE-----";

/// One file written to the output directory. The bytes are kept so the
/// distribution step can push without re-reading the disk.
#[derive(Debug, Clone)]
pub struct ArtifactFile {
    pub role: ArtifactRole,
    pub format: FormatKind,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// What one domain's write produced: everything that landed, and every
/// format that failed. A failed format never blocks its siblings.
#[derive(Debug, Default)]
pub struct WriteOutcome {
    pub written: Vec<ArtifactFile>,
    pub failures: Vec<ConvertError>,
}

impl WriteOutcome {
    pub fn file_names(&self) -> Vec<String> {
        self.written.iter().map(|a| a.file_name.clone()).collect()
    }
}

pub struct FormatConverter {
    output_dir: PathBuf,
}

impl FormatConverter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Write one domain's artifact set in every requested format, under its
    /// primary name and every alternate name.
    pub fn write(
        &self,
        domain: &DomainConfig,
        material: &CertificateMaterial,
        formats: &[FormatKind],
        naming_format: &str,
    ) -> WriteOutcome {
        let base = naming::base_name(naming_format, &domain.domain, domain.custom_name.as_deref());
        let mut names = vec![base];
        names.extend(domain.alt_file_names.iter().cloned());

        let mut outcome = WriteOutcome::default();
        for name in &names {
            for &format in formats {
                match self.write_format(name, domain.separator, format, material) {
                    Ok(mut files) => outcome.written.append(&mut files),
                    Err(e) => {
                        debug!(domain = %domain.domain, error = %e, "format write failed");
                        outcome.failures.push(e);
                    }
                }
            }
        }
        info!(
            domain = %domain.domain,
            files = outcome.written.len(),
            failures = outcome.failures.len(),
            "wrote certificate artifacts"
        );
        outcome
    }

    fn write_format(
        &self,
        base: &str,
        separator: Separator,
        format: FormatKind,
        material: &CertificateMaterial,
    ) -> Result<Vec<ArtifactFile>, ConvertError> {
        let mut files = Vec::new();
        for &role in naming::roles_for(format) {
            let bytes = artifact_bytes(format, role, material, base)
                .map_err(|cause| ConvertError {
                    format,
                    role,
                    cause,
                })?;
            let file_name = naming::artifact_file_name(base, separator, format, role);
            self.persist(&file_name, &bytes).map_err(|e| ConvertError {
                format,
                role,
                cause: e.to_string(),
            })?;
            files.push(ArtifactFile {
                role,
                format,
                file_name,
                bytes,
            });
        }
        Ok(files)
    }

    fn persist(&self, file_name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        let mut staged = NamedTempFile::new_in(&self.output_dir)?;
        staged.write_all(bytes)?;
        staged.as_file().sync_all()?;
        let path = self.output_dir.join(file_name);
        staged.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    }
}

fn artifact_bytes(
    format: FormatKind,
    role: ArtifactRole,
    material: &CertificateMaterial,
    bundle_name: &str,
) -> Result<Vec<u8>, String> {
    let bytes = match (format, role) {
        (FormatKind::Pem, ArtifactRole::Cert) => leaf_pem(material).into_bytes(),
        (FormatKind::Pem, ArtifactRole::Chain) => {
            intermediates_pem(&material.chain_pem).into_bytes()
        }
        (FormatKind::Pem, ArtifactRole::Privkey) | (FormatKind::Key, ArtifactRole::Privkey) => {
            material.key_pem.clone().into_bytes()
        }
        (FormatKind::Pem, ArtifactRole::Fullchain) | (FormatKind::Crt, ArtifactRole::Chain) => {
            material.chain_pem.clone().into_bytes()
        }
        (FormatKind::Pfx, ArtifactRole::Fullchain) => build_pfx(bundle_name, material, "")?,
        (format, role) => return Err(format!("no {format} artifact for role {role}")),
    };
    Ok(bytes)
}

/// The leaf on its own: the issuer's dedicated field when present, the
/// first chain certificate otherwise.
fn leaf_pem(material: &CertificateMaterial) -> String {
    if !material.leaf_pem.trim().is_empty() {
        return material.leaf_pem.clone();
    }
    split_pem_certificates(&material.chain_pem)
        .into_iter()
        .next()
        .unwrap_or_default()
}

/// Everything after the leaf. Empty when the chain holds a single
/// certificate; the file is still written so the artifact set stays
/// deterministic.
fn intermediates_pem(chain_pem: &str) -> String {
    let certs = split_pem_certificates(chain_pem);
    if certs.len() <= 1 {
        return String::new();
    }
    certs[1..].join("\n")
}

fn split_pem_certificates(chain_pem: &str) -> Vec<String> {
    let mut certs = Vec::new();
    for part in chain_pem.split(PEM_CERT_BEGIN).skip(1) {
        if let Some(end) = part.find(PEM_CERT_END) {
            let body = &part[..end];
            certs.push(format!("{PEM_CERT_BEGIN}{body}{PEM_CERT_END}"));
        }
    }
    certs
}

/// PKCS#12 bundle of leaf + intermediates + key. No protecting password by
/// default: consumers of unattended imports (IIS, some appliances) choke on
/// passworded bundles, so protection is left to directory permissions or a
/// wrapping layer. Pass a non-empty `password` to opt in.
fn build_pfx(
    name: &str,
    material: &CertificateMaterial,
    password: &str,
) -> Result<Vec<u8>, String> {
    let key = PKey::private_key_from_pem(material.key_pem.as_bytes())
        .map_err(|e| format!("parse private key: {e}"))?;
    let chain = X509::stack_from_pem(material.chain_pem.as_bytes())
        .map_err(|e| format!("parse chain: {e}"))?;

    let leaf_from_field = if material.leaf_pem.trim().is_empty() {
        None
    } else {
        X509::from_pem(material.leaf_pem.as_bytes()).ok()
    };
    let (leaf, ca_certs): (X509, Vec<X509>) = match leaf_from_field {
        Some(leaf) => (leaf, chain),
        None => {
            let mut iter = chain.into_iter();
            let leaf = iter.next().ok_or("no certificates in chain")?;
            (leaf, iter.collect())
        }
    };

    let mut builder = Pkcs12::builder();
    builder.name(name).pkey(&key).cert(&leaf);
    if !ca_certs.is_empty() {
        let mut stack = Stack::new().map_err(|e| format!("ca stack: {e}"))?;
        for cert in ca_certs {
            stack.push(cert).map_err(|e| format!("ca stack: {e}"))?;
        }
        builder.ca(stack);
    }
    let bundle = builder
        .build2(password)
        .map_err(|e| format!("build pkcs12: {e}"))?;
    bundle.to_der().map_err(|e| format!("serialize pkcs12: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_chains_textually() {
        let chain = "-----BEGIN CERTIFICATE-----\nleaf\n-----END CERTIFICATE-----\n\
                     -----BEGIN CERTIFICATE-----\nmid\n-----END CERTIFICATE-----\n\
                     -----BEGIN CERTIFICATE-----\nroot\n-----END CERTIFICATE-----\n";
        let certs = split_pem_certificates(chain);
        assert_eq!(certs.len(), 3);
        assert!(certs[0].contains("leaf"));

        let intermediates = intermediates_pem(chain);
        assert!(!intermediates.contains("leaf"));
        assert!(intermediates.contains("mid"));
        assert!(intermediates.contains("root"));
    }

    #[test]
    fn single_certificate_chain_has_no_intermediates() {
        let chain = "-----BEGIN CERTIFICATE-----\nonly\n-----END CERTIFICATE-----\n";
        assert_eq!(intermediates_pem(chain), "");
    }

    #[test]
    fn leaf_falls_back_to_first_chain_certificate() {
        let material = CertificateMaterial {
            chain_pem: "-----BEGIN CERTIFICATE-----\nleaf\n-----END CERTIFICATE-----\n"
                .to_string(),
            leaf_pem: String::new(),
            key_pem: "key".to_string(),
        };
        assert!(leaf_pem(&material).contains("leaf"));
    }
}
