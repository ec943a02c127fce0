//! # Error Types
//!
//! Domain-specific error types for gluco-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  gluco-core errors (this file)                                         │
//! │  ├── CoreError        - Payload / domain errors                        │
//! │  └── ValidationError  - Record validation failures                     │
//! │                                                                         │
//! │  gluco-db errors (separate crate)                                      │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  gluco-sync errors (separate crate)                                    │
//! │  └── SyncError        - Channel, protocol and store failures           │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → SyncError → log line    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record batch could not be decoded.
    ///
    /// ## When This Occurs
    /// - Peer closed the channel mid-transfer (truncated JSON)
    /// - Payload is not a JSON array of records
    /// - Payload is not valid UTF-8
    #[error("Invalid record payload: {0}")]
    InvalidPayload(String),

    /// A record batch could not be encoded.
    #[error("Failed to encode records: {0}")]
    EncodeFailed(String),

    /// Unknown device role string.
    #[error("Unknown device role: '{0}'. Valid options: phone, wearable, other")]
    UnknownRole(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Record validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}, got {actual}")]
    OutOfRange {
        field: String,
        min: i64,
        max: i64,
        actual: i64,
    },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::InvalidPayload("EOF while parsing".to_string());
        assert_eq!(err.to_string(), "Invalid record payload: EOF while parsing");

        let err = ValidationError::MustBePositive {
            field: "timestamp".to_string(),
        };
        assert_eq!(err.to_string(), "timestamp must be positive");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::MustBePositive {
            field: "timestamp".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
