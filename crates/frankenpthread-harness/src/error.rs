//! Harness error type.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown scenario '{0}' (try `harness list`)")]
    UnknownScenario(String),
    #[error("unknown mode '{0}' (expected strict or hardened)")]
    UnknownMode(String),
    #[error("report digest mismatch: recorded {recorded}, computed {computed}")]
    DigestMismatch { recorded: String, computed: String },
    #[error("report tallies say {recorded} passed, results show {counted}")]
    InconsistentTally { recorded: usize, counted: usize },
    #[error("{failed} of {total} scenarios failed")]
    ScenariosFailed { failed: usize, total: usize },
    #[error("{0} invalid log line(s)")]
    InvalidLog(usize),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
