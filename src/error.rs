use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("invalid range '{token}': end session precedes start session")]
    InvalidRange { token: String },

    #[error("failed to flush history cache: {source}")]
    Flush {
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to serialize output record: {0}")]
    SerializeOutput(#[from] serde_json::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl HistoryError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
