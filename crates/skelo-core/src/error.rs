//! The domain error taxonomy.
//!
//! API handlers map these variants onto HTTP status codes: `Validation` to
//! 400, `NotFound` to 404, `Transition` to 409, everything else to 500.

use skelo_db::models::TaskStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkeloError {
    /// Malformed input: missing field, unknown id in `depends_on`,
    /// duplicate or unknown DAG key, self-dependency, cycle, missing
    /// template variable.
    #[error("{0}")]
    Validation(String),

    /// A referenced id does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The attempted status transition is not in the permitted set, or the
    /// row changed concurrently.
    #[error("invalid transition {from} -> {to}: {reason}")]
    Transition {
        from: TaskStatus,
        to: TaskStatus,
        reason: String,
    },

    /// An adapter returned a failure or threw.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// Unexpected failure; logged and surfaced opaquely.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SkeloError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
