//! Error types for codec-ablate operations.

use thiserror::Error;

/// Result type alias for codec-ablate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while planning, running or analysing an ablation study.
///
/// Encoder failures and missing metrics are not errors. They are recorded as
/// statuses on result rows.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The experiment file is malformed.
    #[error("Config error: {0}")]
    Config(String),

    /// An argument token is not of the form `--Key=Value`.
    #[error("Invalid argument {token:?}: {reason}")]
    InvalidArgument {
        /// The offending token.
        token: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The quality (or rate) ranges of two RD curves do not overlap.
    #[error("RD ranges do not overlap: [{low}, {high}]")]
    NoOverlap {
        /// Lower bound of the (empty) overlap interval.
        low: f64,
        /// Upper bound of the (empty) overlap interval.
        high: f64,
    },

    /// Not enough usable points to fit an RD curve.
    #[error("Insufficient RD points: have {have}, need {need}")]
    InsufficientPoints {
        /// Number of usable points.
        have: usize,
        /// Minimum number required.
        need: usize,
    },

    /// The worker pool could not be created.
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// I/O error wrapper.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// CSV error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    /// Short stable name used in status strings (e.g. `BDERR:NoOverlap`).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "Config",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::NoOverlap { .. } => "NoOverlap",
            Self::InsufficientPoints { .. } => "InsufficientPoints",
            Self::ThreadPool(_) => "ThreadPool",
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
            Self::Yaml(_) => "Yaml",
            Self::Csv(_) => "Csv",
        }
    }
}
