//! Error types for proxy probing

use thiserror::Error;

/// Errors surfaced by configuration, persistence and harvesting.
///
/// Individual probe failures are never reported through this type; they are
/// recorded in the proxy's [`ProbeOutcome`](crate::proxy::ProbeOutcome).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid proxy {input:?}: {reason}")]
    InvalidProxy { input: String, reason: String },

    #[error("Concurrency limit must be at least 1")]
    InvalidConcurrency,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Candidates cannot be changed once a run has started")]
    AlreadyStarted,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{} errors occurred: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<Error>),
}

impl Error {
    /// Fold a list of errors into a single result, `Ok` when the list is empty.
    pub fn collect(mut errors: Vec<Error>) -> std::result::Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    /// Returns true for errors caused by bad setup rather than I/O
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::InvalidUrl { .. }
                | Error::InvalidProxy { .. }
                | Error::InvalidConcurrency
                | Error::InvalidConfig(_)
        )
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
