//! # Sync Configuration
//!
//! Configuration types for the GlucoSync channel sync engine.
//!
//! ## Configuration Sources (Priority Order)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  Configuration Loading Order                            │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     GLUCO_DEVICE_ID, GLUCO_DEVICE_NAME, GLUCO_DEVICE_ROLE,              │
//! │     GLUCO_HUB_PORT, GLUCO_PEERS                                         │
//! │                                                                         │
//! │  2. Config File (sync.toml)                                            │
//! │     Located in app data directory                                      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Phone role, 1s x 10 polls, 3 retries 10s apart, port 8765          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use gluco_core::{DeviceRole, RetentionPolicy, DB_SYNC_CHANNEL_PATH};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::WaitPolicy;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier, also used as the node id on the wire.
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Pixel 8", "Wrist").
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Role of this device in the sync topology.
    #[serde(default)]
    pub role: DeviceRole,
}

fn default_device_name() -> String {
    "GlucoSync Device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
            role: DeviceRole::default(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Handshake wait and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Channel path that identifies DB sync transfers.
    #[serde(default = "default_channel_path")]
    pub channel_path: String,

    /// Interval between completion polls (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Polls before an attempt is considered timed out.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,

    /// Retries after the first timed-out attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause before each retry (seconds).
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Request a sync as soon as the node starts.
    #[serde(default)]
    pub sync_on_start: bool,
}

fn default_channel_path() -> String {
    DB_SYNC_CHANNEL_PATH.to_string()
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_max_polls() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    10
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            channel_path: default_channel_path(),
            poll_interval_ms: default_poll_interval(),
            max_polls: default_max_polls(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff(),
            sync_on_start: false,
        }
    }
}

// =============================================================================
// Retention Settings
// =============================================================================

/// Windows that bound what is exported and what a satellite keeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// How far back the phone exports to a satellite (hours).
    #[serde(default = "default_satellite_hours")]
    pub satellite_export_window_hours: u64,

    /// How long a satellite keeps values after sending (hours).
    #[serde(default = "default_satellite_hours")]
    pub satellite_retention_window_hours: u64,

    /// How far back a satellite exports to the phone (days).
    #[serde(default = "default_history_days")]
    pub history_window_days: u64,
}

fn default_satellite_hours() -> u64 {
    24
}

fn default_history_days() -> u64 {
    90
}

impl Default for RetentionSettings {
    fn default() -> Self {
        RetentionSettings {
            satellite_export_window_hours: default_satellite_hours(),
            satellite_retention_window_hours: default_satellite_hours(),
            history_window_days: default_history_days(),
        }
    }
}

// =============================================================================
// Hub Settings
// =============================================================================

/// Settings for the WebSocket endpoint peers connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Serve inbound channels and commands.
    #[serde(default = "default_hub_enabled")]
    pub enabled: bool,

    /// Address to bind to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Port for the WebSocket server.
    #[serde(default = "default_hub_port")]
    pub port: u16,
}

fn default_hub_enabled() -> bool {
    true
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_hub_port() -> u16 {
    8765
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            enabled: default_hub_enabled(),
            bind_addr: default_bind_addr(),
            port: default_hub_port(),
        }
    }
}

impl HubSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Peer Configuration
// =============================================================================

/// A reachable peer node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// The peer's device id.
    pub id: String,

    /// Base WebSocket URL of the peer's hub (ws:// or wss://).
    pub url: String,
}

impl PeerConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        PeerConfig {
            id: id.into(),
            url: url.into(),
        }
    }
}

/// Parses `id=url` pairs separated by commas, as used by `GLUCO_PEERS`.
pub fn parse_peers(list: &str) -> SyncResult<Vec<PeerConfig>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, url) = entry.split_once('=').ok_or_else(|| {
                SyncError::InvalidConfig(format!("peer entry must be id=url, got: {}", entry))
            })?;
            Ok(PeerConfig::new(id.trim(), url.trim()))
        })
        .collect()
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
///
/// ## Example TOML
/// ```toml
/// [device]
/// id = "phone-1"
/// name = "Pixel"
/// role = "phone"
///
/// [sync]
/// poll_interval_ms = 1000
/// max_polls = 10
/// max_retries = 3
/// retry_backoff_secs = 10
///
/// [retention]
/// satellite_export_window_hours = 24
/// history_window_days = 90
///
/// [hub]
/// port = 8765
///
/// [[peers]]
/// id = "watch-1"
/// url = "ws://192.168.1.20:8765"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Wait and retry settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Export and pruning windows.
    #[serde(default)]
    pub retention: RetentionSettings,

    /// Hub server settings.
    #[serde(default)]
    pub hub: HubSettings,

    /// Peers this node can reach.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if !self.sync.channel_path.starts_with('/') {
            return Err(SyncError::InvalidConfig(format!(
                "channel_path must start with '/', got: {}",
                self.sync.channel_path
            )));
        }

        if self.sync.poll_interval_ms == 0 || self.sync.max_polls == 0 {
            return Err(SyncError::InvalidConfig(
                "poll_interval_ms and max_polls must be greater than 0".into(),
            ));
        }

        if self.retention.satellite_export_window_hours == 0
            || self.retention.satellite_retention_window_hours == 0
            || self.retention.history_window_days == 0
        {
            return Err(SyncError::InvalidConfig(
                "retention windows must be greater than 0".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if peer.id.is_empty() {
                return Err(SyncError::InvalidConfig("peer id must not be empty".into()));
            }
            if peer.id == self.device.id {
                return Err(SyncError::InvalidConfig(format!(
                    "peer {} has this device's own id",
                    peer.id
                )));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(SyncError::InvalidConfig(format!(
                    "duplicate peer id: {}",
                    peer.id
                )));
            }
            if !peer.url.starts_with("ws://") && !peer.url.starts_with("wss://") {
                return Err(SyncError::InvalidUrl(format!(
                    "Peer URL must start with ws:// or wss://, got: {}",
                    peer.url
                )));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("GLUCO_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("GLUCO_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(role) = std::env::var("GLUCO_DEVICE_ROLE") {
            match role.parse() {
                Ok(parsed) => {
                    debug!(role = %role, "Overriding device role from environment");
                    self.device.role = parsed;
                }
                Err(_) => warn!(role = %role, "Unknown device role in environment"),
            }
        }

        if let Ok(port) = std::env::var("GLUCO_HUB_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding hub port from environment");
                self.hub.port = p;
            }
        }

        if let Ok(list) = std::env::var("GLUCO_PEERS") {
            match parse_peers(&list) {
                Ok(peers) => {
                    debug!(count = peers.len(), "Overriding peers from environment");
                    self.peers = peers;
                }
                Err(e) => warn!(error = %e, "Ignoring GLUCO_PEERS"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "glucosync", "gluco-node")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the device role.
    pub fn role(&self) -> DeviceRole {
        self.device.role
    }

    /// Looks up a configured peer.
    pub fn peer(&self, id: &str) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Returns the handshake wait policy.
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            poll_interval: Duration::from_millis(self.sync.poll_interval_ms),
            max_polls: self.sync.max_polls,
            max_retries: self.sync.max_retries,
            retry_backoff: Duration::from_secs(self.sync.retry_backoff_secs),
        }
    }

    /// Returns the export and pruning windows.
    pub fn retention_policy(&self) -> RetentionPolicy {
        const HOUR_MS: i64 = 60 * 60 * 1000;
        let r = &self.retention;
        RetentionPolicy::new(
            r.satellite_export_window_hours as i64 * HOUR_MS,
            r.satellite_retention_window_hours as i64 * HOUR_MS,
            r.history_window_days as i64 * 24 * HOUR_MS,
        )
    }
}
