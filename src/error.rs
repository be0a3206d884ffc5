use thiserror::Error;

/// Everything that can go wrong while syncing one series.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("fetch from {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("failed to parse payload: {0}")]
    Parse(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<duckdb::Error> for SyncError {
    fn from(e: duckdb::Error) -> Self {
        SyncError::Persistence(e.to_string())
    }
}

impl SyncError {
    pub(crate) fn fetch(url: &str, reason: impl ToString) -> Self {
        SyncError::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}
