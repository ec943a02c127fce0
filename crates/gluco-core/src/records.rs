//! # Record Codec
//!
//! JSON wire format for record batches sent over a sync channel.
//!
//! ## Wire Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  One channel carries exactly one batch: a UTF-8 JSON array.            │
//! │                                                                         │
//! │  [                                                                      │
//! │    {"timestamp": 1700000000000, "value": 112, "rate": -0.5},           │
//! │    {"timestamp": 1700000060000, "value": 110}                          │
//! │  ]                                                                      │
//! │                                                                         │
//! │  The receiver reads until end-of-stream, then decodes the whole        │
//! │  buffer. A truncated stream fails to decode and nothing is imported.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::GlucoseRecord;

/// Decodes a batch of records from its JSON text.
///
/// An empty (or whitespace-only) payload is an empty batch: a sender with
/// nothing to export still opens, flushes and closes its channel.
pub fn decode_records(json: &str) -> CoreResult<Vec<GlucoseRecord>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json).map_err(|e| CoreError::InvalidPayload(e.to_string()))
}

/// Decodes a batch of records from raw channel bytes.
pub fn decode_record_bytes(bytes: &[u8]) -> CoreResult<Vec<GlucoseRecord>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| CoreError::InvalidPayload(format!("not UTF-8: {}", e)))?;
    decode_records(text)
}

/// Encodes a batch of records as JSON text.
pub fn encode_records(records: &[GlucoseRecord]) -> CoreResult<String> {
    serde_json::to_string(records).map_err(|e| CoreError::EncodeFailed(e.to_string()))
}
