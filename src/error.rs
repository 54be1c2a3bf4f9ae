//! Errors that end a call before any device is contacted.
//!
//! Failures on individual devices never show up here; they are recorded as
//! [Outcome::Failure](crate::core::Outcome::Failure) values in the result set.

use thiserror::Error;

/// A pre-flight misconfiguration. Returned before any device is contacted.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(
        "No roster specified. Please use the `roster` argument, or set the `roster` option in \
         the configuration."
    )]
    NoRoster,

    #[error("unknown roster: {0}")]
    UnknownRoster(String),

    #[error(transparent)]
    Roster(#[from] RosterError),

    #[error("no function named {0:?} is registered")]
    UnknownFunction(String),

    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error("device {0:?} appears more than once in the device set")]
    DuplicateDevice(String),

    #[error("invalid device set: {0}")]
    InvalidDeviceSet(String),
}

/// Errors a [Roster](crate::roster::Roster) reports while expanding a target expression.
#[derive(Debug, Error)]
pub enum RosterError {
    #[error("invalid target expression {expression:?}: {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("unknown target type: {0}")]
    UnknownTargetType(String),

    #[error("unknown nodegroup: {0}")]
    UnknownNodegroup(String),

    #[error("roster data source failed: {0:#}")]
    Source(#[from] anyhow::Error),
}

impl RosterError {
    pub(crate) fn invalid(expression: impl Into<String>, reason: impl ToString) -> Self {
        RosterError::InvalidExpression {
            expression: expression.into(),
            reason: reason.to_string(),
        }
    }
}
