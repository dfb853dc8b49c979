use serde::Deserialize;
use std::path::PathBuf;

use crate::error::HistoryError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Input lines to accumulate before writing to the database.
    /// Values of 1 or less disable batching entirely.
    pub cache_size: usize,
    /// Record output alongside input lines.
    pub log_output: bool,
    /// Where history databases live. Defaults to the replog home directory.
    pub history_dir: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            cache_size: 0,
            log_output: false,
            history_dir: None,
            busy_timeout_ms: 5000,
        }
    }
}

impl HistoryConfig {
    pub fn load() -> Result<Self, HistoryError> {
        let path = Self::path();
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|source| HistoryError::io(path.clone(), source))?;
        let config =
            toml::from_str(&content).map_err(|source| HistoryError::ConfigParse { path, source })?;
        Ok(config)
    }

    pub fn path() -> PathBuf {
        Self::replog_dir().join("config.toml")
    }

    pub fn replog_dir() -> PathBuf {
        #[cfg(windows)]
        {
            return dirs::data_local_dir()
                .unwrap_or_else(|| dirs::home_dir().expect("Could not determine home directory"))
                .join("replog");
        }
        #[cfg(not(windows))]
        {
            return dirs::home_dir()
                .expect("Could not determine home directory")
                .join(".replog");
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.history_dir {
            Some(dir) => dir.clone(),
            None => Self::replog_dir(),
        }
    }

    /// Database path for a profile: `history.sqlite`, or
    /// `history-<profile>.sqlite` when a profile is given.
    pub fn history_file(&self, profile: Option<&str>) -> PathBuf {
        let name = match profile {
            Some(profile) => format!("history-{profile}.sqlite"),
            None => "history.sqlite".to_string(),
        };
        self.data_dir().join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_batching_and_output() {
        let config = HistoryConfig::default();
        assert_eq!(config.cache_size, 0, "batching should be off by default");
        assert!(!config.log_output, "output logging should be off by default");
        assert_eq!(config.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: HistoryConfig = toml::from_str("cache_size = 50").unwrap();
        assert_eq!(config.cache_size, 50);
        assert!(!config.log_output, "unset fields should fall back to defaults");
        assert_eq!(config.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_history_file_names() {
        let config = HistoryConfig {
            history_dir: Some(PathBuf::from("/tmp/replog")),
            ..Default::default()
        };
        assert_eq!(
            config.history_file(None),
            PathBuf::from("/tmp/replog/history.sqlite")
        );
        assert_eq!(
            config.history_file(Some("dev")),
            PathBuf::from("/tmp/replog/history-dev.sqlite")
        );
    }
}
