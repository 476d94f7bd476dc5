//! Error taxonomy for the scoring engine.
//!
//! Only [`EngineError::Configuration`] is allowed to stop the process, and
//! only at startup. Everything else is logged with its station/parameter
//! context and the affected unit of work is skipped.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Payload that is not JSON or lacks one of the reading fields.
    #[error("malformed reading payload: {0}")]
    MalformedInput(String),

    /// The time-series or metrics collaborator could not be reached.
    #[error("upstream unavailable ({target}): {reason}")]
    UpstreamUnavailable { target: String, reason: String },

    /// A single station could not be scored this cycle.
    #[error("scoring failed for station {station}: {reason}")]
    ScoringFailure { station: String, reason: String },

    /// Invalid static configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl EngineError {
    pub fn upstream(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        EngineError::UpstreamUnavailable {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn scoring(station: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::ScoringFailure {
            station: station.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors that must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
