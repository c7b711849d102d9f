use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures a stage can settle with. All of them are absorbed by the
/// coordinator and folded into the run's terminal report.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage failure at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected asset shape: {0}")]
    UnexpectedAssetShape(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl UpdateError {
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UpdateError::Storage {
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        UpdateError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for UpdateError {
    fn from(e: serde_json::Error) -> Self {
        UpdateError::UnexpectedAssetShape(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
