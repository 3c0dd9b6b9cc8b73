//! Config file resolution

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use tandem_core::TandemConfig;

const CONFIG_FILE: &str = "tandem.toml";

/// Default config location for this user, if the platform has one
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "onyx", "tandem").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Load the config from an explicit path, or from the default location.
/// A missing file yields defaults.
pub fn load(explicit: Option<&Path>) -> Result<TandemConfig> {
    let Some(path) = explicit.map(Path::to_path_buf).or_else(default_config_path) else {
        tracing::debug!("No config directory available, using defaults");
        return Ok(TandemConfig::default());
    };

    TandemConfig::load(&path).with_context(|| format!("Failed to load config from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[relay]\nport = 9000\n").unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.relay.max_room_peers, 2);
    }

    #[test]
    fn test_missing_explicit_path() {
        let dir = TempDir::new().unwrap();
        let config = load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, TandemConfig::default());
    }

    #[test]
    fn test_broken_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[relay\n").unwrap();

        let err = load(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("tandem.toml"));
    }
}
