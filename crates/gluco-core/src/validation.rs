//! # Validation Module
//!
//! Checks applied to records received from a peer before they are stored.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Codec (records.rs)                                           │
//! │  └── Shape check: JSON array of records                                │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── timestamp must be positive                                        │
//! │  └── value must be a plausible sensor reading                          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  └── PRIMARY KEY(timestamp): duplicates ignored                        │
//! │                                                                         │
//! │  Invalid records are skipped, never fatal for the batch.               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::types::GlucoseRecord;
use crate::{MAX_GLUCOSE_VALUE, MIN_GLUCOSE_VALUE};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a single record.
///
/// ## Example
/// ```rust
/// use gluco_core::{validation::validate_record, GlucoseRecord};
///
/// assert!(validate_record(&GlucoseRecord::new(1_700_000_000_000, 120)).is_ok());
/// assert!(validate_record(&GlucoseRecord::new(0, 120)).is_err());
/// assert!(validate_record(&GlucoseRecord::new(1_700_000_000_000, 0)).is_err());
/// ```
pub fn validate_record(record: &GlucoseRecord) -> ValidationResult<()> {
    if record.timestamp <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "timestamp".to_string(),
        });
    }

    if !(MIN_GLUCOSE_VALUE..=MAX_GLUCOSE_VALUE).contains(&record.value) {
        return Err(ValidationError::OutOfRange {
            field: "value".to_string(),
            min: MIN_GLUCOSE_VALUE as i64,
            max: MAX_GLUCOSE_VALUE as i64,
            actual: record.value as i64,
        });
    }

    Ok(())
}

/// Splits a batch into valid records and the number of rejected ones.
pub fn partition_valid(records: Vec<GlucoseRecord>) -> (Vec<GlucoseRecord>, usize) {
    let total = records.len();
    let valid: Vec<GlucoseRecord> = records
        .into_iter()
        .filter(|r| validate_record(r).is_ok())
        .collect();
    let rejected = total - valid.len();
    (valid, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_bounds() {
        assert!(validate_record(&GlucoseRecord::new(1, MIN_GLUCOSE_VALUE)).is_ok());
        assert!(validate_record(&GlucoseRecord::new(1, MAX_GLUCOSE_VALUE)).is_ok());

        let err = validate_record(&GlucoseRecord::new(1, MAX_GLUCOSE_VALUE + 1)).unwrap_err();
        assert_eq!(
            err,
            ValidationError::OutOfRange {
                field: "value".to_string(),
                min: 1,
                max: 1000,
                actual: 1001,
            }
        );
    }

    #[test]
    fn test_negative_timestamp() {
        assert!(validate_record(&GlucoseRecord::new(-5, 100)).is_err());
    }

    #[test]
    fn test_partition_valid() {
        let batch = vec![
            GlucoseRecord::new(1000, 100),
            GlucoseRecord::new(2000, -3),
            GlucoseRecord::new(0, 100),
            GlucoseRecord::new(3000, 101),
        ];
        let (valid, rejected) = partition_valid(batch);
        assert_eq!(valid.len(), 2);
        assert_eq!(rejected, 2);
    }
}
