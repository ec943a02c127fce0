//! # gluco-core: Pure Domain Logic for GlucoSync
//!
//! This crate holds the domain types shared by the record store and the
//! sync engine. It performs no I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        GlucoSync Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 gluco-sync (Channel Sync Engine)                │   │
//! │  │    request_sync ──► channel open ──► import ──► wait / retry    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ gluco-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  records  │  │ retention │  │ validation│  │   │
//! │  │   │ Glucose   │  │ JSON wire │  │  windows  │  │   rules   │  │   │
//! │  │   │ Record    │  │  codec    │  │  per role │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    gluco-db (Record Store)                      │   │
//! │  │           SQLite queries, migrations, glucose repository        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (GlucoseRecord, DeviceRole, RetentionPolicy)
//! - [`records`] - JSON wire codec for record batches
//! - [`error`] - Domain error types
//! - [`validation`] - Record validation
//!
//! ## Example Usage
//!
//! ```rust
//! use gluco_core::{decode_records, DeviceRole, RetentionPolicy};
//!
//! let records = decode_records(r#"[{"timestamp": 1700000000000, "value": 120}]"#).unwrap();
//! assert_eq!(records[0].value, 120);
//!
//! // The phone only sends the last day to a wearable
//! let policy = RetentionPolicy::default();
//! let cutoff = DeviceRole::Phone.export_cutoff(1_700_000_000_000, &policy);
//! assert_eq!(cutoff, 1_700_000_000_000 - policy.satellite_export_window_ms());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod records;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use records::{decode_record_bytes, decode_records, encode_records};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Well-known channel path used for database sync transfers.
///
/// Channel events on any other path belong to other features and are
/// never consumed by the sync engine.
pub const DB_SYNC_CHANNEL_PATH: &str = "/gdh_db_sync";

/// Lowest glucose value (mg/dl) accepted from a peer.
pub const MIN_GLUCOSE_VALUE: i32 = 1;

/// Highest glucose value (mg/dl) accepted from a peer.
pub const MAX_GLUCOSE_VALUE: i32 = 1000;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
