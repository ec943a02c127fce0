//! # Domain Types
//!
//! Core domain types shared by the record store and the sync engine.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────────┐   │
//! │  │  GlucoseRecord  │   │   DeviceRole    │   │  RetentionPolicy    │   │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────────  │   │
//! │  │  timestamp (ms) │   │  Phone          │   │  satellite export   │   │
//! │  │  value (mg/dl)  │   │  Wearable       │   │  satellite keep     │   │
//! │  │  rate?          │   │  Other          │   │  full history       │   │
//! │  │  alarm?         │   └─────────────────┘   └─────────────────────┘   │
//! │  │  source?        │                                                    │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Topology
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │   PHONE (primary)                           WEARABLE (satellite)        │
//! │   full history ◄──── wearable sends full ────  rolling 24h window       │
//! │                ───── phone sends last 24h ───►                          │
//! │                                                                         │
//! │   After a successful receive the phone asks the wearable to pull,     │
//! │   so new values hop back toward the satellite (chained propagation).   │
//! │   After a successful send the wearable prunes to its 24h window.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// =============================================================================
// Glucose Record
// =============================================================================

/// A single sensor reading.
///
/// Records are keyed by `timestamp`: two records with the same timestamp are
/// the same reading, which is what makes imports idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[serde(rename_all = "camelCase")]
pub struct GlucoseRecord {
    /// Reading time in milliseconds since the Unix epoch.
    pub timestamp: i64,

    /// Glucose value in mg/dl.
    pub value: i32,

    /// Rate of change (mg/dl per minute), if the sensor reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,

    /// Alarm flags raised for this reading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm: Option<i32>,

    /// Name of the source app/sensor that produced the reading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl GlucoseRecord {
    /// Creates a record with only the mandatory fields set.
    pub fn new(timestamp: i64, value: i32) -> Self {
        GlucoseRecord {
            timestamp,
            value,
            rate: None,
            alarm: None,
            source: None,
        }
    }

    /// Sets the rate of change.
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Sets the source name.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// =============================================================================
// Device Role
// =============================================================================

/// Which side of the topology this device occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Primary device holding the full history.
    #[default]
    Phone,

    /// Satellite device keeping a rolling window.
    Wearable,

    /// Any other consumer (e.g. a car display). Never chains, never prunes.
    Other,
}

impl DeviceRole {
    /// Returns true if a finished receive on this device must trigger a
    /// further sync toward the next hop.
    pub fn chains_propagation(&self) -> bool {
        matches!(self, DeviceRole::Phone)
    }

    /// Returns true if a successful send reclaims local storage.
    pub fn prunes_after_send(&self) -> bool {
        matches!(self, DeviceRole::Wearable)
    }

    /// Oldest timestamp (inclusive) this device exports when pushing data.
    ///
    /// The primary only ships the satellite window to a satellite; every
    /// other role ships its full history window.
    pub fn export_cutoff(&self, now_ms: i64, policy: &RetentionPolicy) -> i64 {
        match self {
            DeviceRole::Phone => now_ms - policy.satellite_export_window_ms(),
            DeviceRole::Wearable | DeviceRole::Other => now_ms - policy.history_window_ms(),
        }
    }
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRole::Phone => write!(f, "phone"),
            DeviceRole::Wearable => write!(f, "wearable"),
            DeviceRole::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for DeviceRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "phone" | "primary" | "mobile" => Ok(DeviceRole::Phone),
            "wearable" | "wear" | "watch" | "satellite" => Ok(DeviceRole::Wearable),
            "other" | "auto" => Ok(DeviceRole::Other),
            other => Err(CoreError::UnknownRole(other.to_string())),
        }
    }
}

// =============================================================================
// Retention Policy
// =============================================================================

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Default window the primary exports to a satellite (24 hours).
pub const DEFAULT_SATELLITE_EXPORT_WINDOW_MS: i64 = 24 * HOUR_MS;

/// Default window a satellite keeps after a successful send (24 hours).
pub const DEFAULT_SATELLITE_RETENTION_WINDOW_MS: i64 = 24 * HOUR_MS;

/// Default full history window (90 days).
pub const DEFAULT_HISTORY_WINDOW_MS: i64 = 90 * 24 * HOUR_MS;

/// Fixed time windows governing what is exported and what is kept.
///
/// The windows are configured, never negotiated between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    satellite_export_window_ms: i64,
    satellite_retention_window_ms: i64,
    history_window_ms: i64,
}

impl RetentionPolicy {
    /// Creates a policy from explicit windows in milliseconds.
    pub const fn new(
        satellite_export_window_ms: i64,
        satellite_retention_window_ms: i64,
        history_window_ms: i64,
    ) -> Self {
        RetentionPolicy {
            satellite_export_window_ms,
            satellite_retention_window_ms,
            history_window_ms,
        }
    }

    /// Window the primary exports to a satellite.
    pub const fn satellite_export_window_ms(&self) -> i64 {
        self.satellite_export_window_ms
    }

    /// Window a satellite keeps locally.
    pub const fn satellite_retention_window_ms(&self) -> i64 {
        self.satellite_retention_window_ms
    }

    /// Full history window.
    pub const fn history_window_ms(&self) -> i64 {
        self.history_window_ms
    }

    /// Timestamp before which a satellite deletes its local records.
    pub fn prune_cutoff(&self, now_ms: i64) -> i64 {
        now_ms - self.satellite_retention_window_ms
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::new(
            DEFAULT_SATELLITE_EXPORT_WINDOW_MS,
            DEFAULT_SATELLITE_RETENTION_WINDOW_MS,
            DEFAULT_HISTORY_WINDOW_MS,
        )
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
