//! Output formats, artifact roles and the file naming policy.
//!
//! Formats and roles are closed enums so a new format cannot be added
//! without the compiler pointing at every match that must handle it.

use serde::{Deserialize, Serialize};

/// Output file formats a domain's certificate material can be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Pem,
    Crt,
    Key,
    Pfx,
}

impl std::fmt::Display for FormatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FormatKind::Pem => "pem",
            FormatKind::Crt => "crt",
            FormatKind::Key => "key",
            FormatKind::Pfx => "pfx",
        };
        f.write_str(s)
    }
}

/// Logical role of an artifact file. Also the only legal keys of a host's
/// `file_overrides` map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactRole {
    Cert,
    Chain,
    Privkey,
    Fullchain,
}

impl std::fmt::Display for ArtifactRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactRole::Cert => "cert",
            ArtifactRole::Chain => "chain",
            ArtifactRole::Privkey => "privkey",
            ArtifactRole::Fullchain => "fullchain",
        };
        f.write_str(s)
    }
}

/// Separator joining the base name to the role suffix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Separator {
    #[default]
    #[serde(rename = "_")]
    Underscore,
    #[serde(rename = "-")]
    Dash,
    #[serde(rename = ".")]
    Dot,
}

impl Separator {
    pub fn as_char(self) -> char {
        match self {
            Separator::Underscore => '_',
            Separator::Dash => '-',
            Separator::Dot => '.',
        }
    }
}

/// The roles a format materializes. PEM emits one file per role; CRT and
/// KEY are single-role conveniences; PFX is one bundle carrying the full
/// chain plus key, filed under the fullchain role.
pub fn roles_for(format: FormatKind) -> &'static [ArtifactRole] {
    match format {
        FormatKind::Pem => &[
            ArtifactRole::Cert,
            ArtifactRole::Chain,
            ArtifactRole::Privkey,
            ArtifactRole::Fullchain,
        ],
        FormatKind::Crt => &[ArtifactRole::Chain],
        FormatKind::Key => &[ArtifactRole::Privkey],
        FormatKind::Pfx => &[ArtifactRole::Fullchain],
    }
}

/// Base file name for a domain: `naming_format` with `{domain}` replaced by
/// the custom name when one is set, the domain otherwise.
pub fn base_name(naming_format: &str, domain: &str, custom_name: Option<&str>) -> String {
    let subject = match custom_name {
        Some(name) if !name.is_empty() => name,
        _ => domain,
    };
    naming_format.replace("{domain}", subject)
}

/// Concrete file name for one artifact.
pub fn artifact_file_name(
    base: &str,
    separator: Separator,
    format: FormatKind,
    role: ArtifactRole,
) -> String {
    match format {
        FormatKind::Pem => format!("{base}{}{role}.pem", separator.as_char()),
        FormatKind::Crt => format!("{base}.crt"),
        FormatKind::Key => format!("{base}.key"),
        FormatKind::Pfx => format!("{base}.pfx"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_names_join_base_and_role_with_separator() {
        let base = base_name("{domain}", "example.com", None);
        assert_eq!(base, "example.com");
        let names: Vec<String> = roles_for(FormatKind::Pem)
            .iter()
            .map(|&role| artifact_file_name(&base, Separator::Underscore, FormatKind::Pem, role))
            .collect();
        assert_eq!(
            names,
            vec![
                "example.com_cert.pem",
                "example.com_chain.pem",
                "example.com_privkey.pem",
                "example.com_fullchain.pem",
            ]
        );
    }

    #[test]
    fn custom_name_replaces_domain() {
        assert_eq!(
            base_name("{domain}", "example.com", Some("web")),
            "web"
        );
        // Empty custom name falls back to the domain.
        assert_eq!(base_name("{domain}", "example.com", Some("")), "example.com");
    }

    #[test]
    fn single_file_formats_ignore_separator() {
        assert_eq!(
            artifact_file_name("web", Separator::Dash, FormatKind::Crt, ArtifactRole::Chain),
            "web.crt"
        );
        assert_eq!(
            artifact_file_name("web", Separator::Dot, FormatKind::Key, ArtifactRole::Privkey),
            "web.key"
        );
        assert_eq!(
            artifact_file_name(
                "web",
                Separator::Underscore,
                FormatKind::Pfx,
                ArtifactRole::Fullchain
            ),
            "web.pfx"
        );
    }

    #[test]
    fn separators_serialize_as_their_character() {
        assert_eq!(serde_json::to_string(&Separator::Dash).unwrap(), "\"-\"");
        let parsed: Separator = serde_json::from_str("\".\"").unwrap();
        assert_eq!(parsed, Separator::Dot);
        assert!(serde_json::from_str::<Separator>("\"+\"").is_err());
    }
}
