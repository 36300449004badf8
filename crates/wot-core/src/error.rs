//! Error types for the core crate.

use thiserror::Error;

/// Errors raised at the validation boundary.
///
/// These never mutate state: a caller that receives one of these can assume
/// the engine looks exactly as it did before the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A parameter failed validation (out-of-range value, malformed
    /// nickname, negative edition, oversized comment, ...).
    #[error("invalid parameter: {reason}")]
    InvalidParameter {
        /// Human-readable description of what was rejected and why.
        reason: String,
    },

    /// A content-address key could not be parsed, or a key of the wrong
    /// kind was supplied (insert where request is required, or vice versa).
    #[error("malformed URL: {reason}")]
    MalformedUrl {
        /// Human-readable description of the defect.
        reason: String,
    },
}

impl CoreError {
    /// Shorthand for an [`CoreError::InvalidParameter`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        CoreError::InvalidParameter {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`CoreError::MalformedUrl`].
    pub fn malformed(reason: impl Into<String>) -> Self {
        CoreError::MalformedUrl {
            reason: reason.into(),
        }
    }
}

/// Result type alias for [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;
