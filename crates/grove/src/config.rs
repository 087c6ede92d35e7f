//! Connection tuning knobs, optionally loaded from `grove.toml`.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SpaceError;

pub const CONFIG_FILE: &str = "grove.toml";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How often the local-op buffer is drained to disk.
    pub flush_interval_ms: u64,
    /// How often the watcher polls peer files.
    pub watch_poll_ms: u64,
    /// How often the secrets blob is compared and saved.
    pub secrets_poll_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 500,
            watch_poll_ms: 200,
            secrets_poll_ms: 1_000,
        }
    }
}

impl ConnectionConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn watch_poll(&self) -> Duration {
        Duration::from_millis(self.watch_poll_ms)
    }

    pub fn secrets_poll(&self) -> Duration {
        Duration::from_millis(self.secrets_poll_ms)
    }

    /// Load from `<dir>/grove.toml`; a missing file means defaults.
    pub fn load(dir: &Path) -> Result<Self, SpaceError> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents =
            fs::read_to_string(&path).map_err(|source| SpaceError::io(&path, source))?;
        toml::from_str(&contents).map_err(|err| SpaceError::InvalidConfig {
            path,
            reason: err.to_string(),
        })
    }

    pub fn write(&self, dir: &Path) -> Result<(), SpaceError> {
        let path = dir.join(CONFIG_FILE);
        let contents = toml::to_string_pretty(self).map_err(|err| SpaceError::InvalidConfig {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        atomic_write(&path, contents.as_bytes())
    }
}

/// Write via a temp file in the same directory, then rename into place.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<(), SpaceError> {
    let dir = path.parent().ok_or_else(|| SpaceError::InvalidConfig {
        path: path.to_path_buf(),
        reason: "path has no parent directory".into(),
    })?;
    let mut temp =
        tempfile::NamedTempFile::new_in(dir).map_err(|source| SpaceError::io(dir, source))?;
    temp.write_all(data)
        .map_err(|source| SpaceError::io(path, source))?;
    temp.persist(path)
        .map_err(|err| SpaceError::io(path, err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_means_defaults() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            ConnectionConfig::load(dir.path()).unwrap(),
            ConnectionConfig::default()
        );
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "flush_interval_ms = 50\n").unwrap();
        let config = ConnectionConfig::load(dir.path()).unwrap();
        assert_eq!(config.flush_interval_ms, 50);
        assert_eq!(config.secrets_poll_ms, 1_000);
    }

    #[test]
    fn garbage_file_is_an_error_with_path_context() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "not = [valid").unwrap();
        let err = ConnectionConfig::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[test]
    fn write_then_load_roundtrips() {
        let dir = TempDir::new().unwrap();
        let config = ConnectionConfig {
            flush_interval_ms: 42,
            ..Default::default()
        };
        config.write(dir.path()).unwrap();
        assert_eq!(ConnectionConfig::load(dir.path()).unwrap(), config);
    }
}
