use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "io";
pub const APP_ORG: &str = "certsync";
pub const APP_NAME: &str = "certsync";

/// Directory holding the configuration file, the vault key and the event
/// log. Overridable for containers that mount a config volume.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("CERTSYNC_CONFIG_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine config directory"))?;
    Ok(dirs.config_dir().to_path_buf())
}

pub fn config_file() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("config.yaml"))
}

/// Fixed location of the persisted vault key. The key value itself can be
/// overridden through the environment; see [`crate::vault::KEY_ENV`].
pub fn vault_key_file() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("vault.key"))
}

pub fn event_log_file() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("events.log"))
}
