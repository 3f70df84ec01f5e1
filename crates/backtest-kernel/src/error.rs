use chrono::{DateTime, Utc};
use thiserror::Error;

/// Kernel-level error taxonomy.
///
/// `ConstraintRejection` (see [`crate::portfolio::RejectionReason`]) is
/// deliberately not a variant here: rejected orders are an expected outcome
/// of normal operation, not a failure of the run.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("invalid input: {0}")]
    InputValidation(String),

    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    #[error("strategy error at {symbol} on {timestamp}: {source}")]
    Strategy {
        symbol: String,
        timestamp: DateTime<Utc>,
        #[source]
        source: anyhow::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl KernelError {
    pub fn input_validation(msg: impl Into<String>) -> Self {
        Self::InputValidation(msg.into())
    }

    pub fn data_unavailable(msg: impl Into<String>) -> Self {
        Self::DataUnavailable(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Exit code a batch CLI collaborator would surface for this error kind,
    /// per the kernel's external-interface contract (0 success is never
    /// returned from here; only the two failure codes apply).
    pub fn exit_code(&self) -> i32 {
        match self {
            KernelError::Configuration(_) => 2,
            _ => 1,
        }
    }
}
