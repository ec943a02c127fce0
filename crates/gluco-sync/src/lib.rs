//! # gluco-sync: Channel Sync Engine for GlucoSync
//!
//! This crate moves glucose records between a phone and its wearable over
//! point-to-point channels, driven by a two-command handshake.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Coordinator Architecture                     │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncCoordinator (one per device)                 │  │
//! │  │                                                                  │  │
//! │  │  request_sync ─► register listener ─► DB_SYNC ─► bounded wait    │  │
//! │  │       ▲                                   │          │            │  │
//! │  │       └────── retry after backoff ◄── timed out      │ done       │  │
//! │  │                                                      ▼            │  │
//! │  │                              REQUEST_DB_SYNC ◄── propagate        │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   Inbound      │  │   Transport    │  │  Outbound              │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Accept channel │  │ Memory (tests) │  │ Open channel to peer   │    │
//! │  │ Read to EOF    │  │ WebSocket +    │  │ Export window as JSON  │    │
//! │  │ Import records │  │ Hub server     │  │ Prune after send       │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  COMMANDS:                                                             │
//! │  • DB_SYNC         - "send me your records"                            │
//! │  • REQUEST_DB_SYNC - "start a sync toward me"                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Protocol
//! - [`coordinator`] - `SyncCoordinator`: sessions, bounded wait, retry
//! - [`inbound`] - Receive path (accept, read, import)
//! - [`outbound`] - Send path (export, write, prune)
//! - [`protocol`] - Command names and envelopes
//! - [`store`] - Record store seam
//!
//! ### Transports
//! - [`transport`] - Channel abstractions shared by every transport
//! - [`memory`] - In-process network for tests and single-process setups
//! - [`websocket`] - WebSocket client side
//! - [`hub`] - WebSocket server side (axum)
//!
//! ### Support
//! - [`config`] - Node configuration (TOML + env)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gluco_sync::{CoordinatorSettings, MemoryNetwork, MemoryRecordStore, SyncCoordinator};
//! use gluco_core::DeviceRole;
//!
//! let network = MemoryNetwork::new();
//! let (transport, commands_rx) = network.create_transport("phone").await;
//! let transport = Arc::new(transport);
//!
//! let coordinator = SyncCoordinator::new(
//!     CoordinatorSettings::new("phone", DeviceRole::Phone),
//!     transport.clone(),
//!     transport,
//!     Arc::new(MemoryRecordStore::new()),
//! );
//! coordinator.serve_commands(commands_rx);
//! coordinator.request_sync();
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Protocol
pub mod coordinator;
pub mod inbound;
pub mod outbound;
pub mod protocol;
pub mod store;

// Transports
pub mod hub;
pub mod memory;
pub mod transport;
pub mod websocket;

// Support
pub mod config;
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Core types
pub use config::{HubSettings, PeerConfig, SyncConfig};
pub use coordinator::{
    CoordinatorSettings, NoOpEmitter, SyncCoordinator, SyncCoordinatorBuilder, SyncEvent,
    SyncEventEmitter, SyncOutcome, SyncStatus, WaitPolicy,
};
pub use error::{SyncError, SyncResult};
pub use outbound::SendReport;
pub use protocol::{Command, CommandEnvelope, CommandSender};
pub use store::{MemoryRecordStore, RecordStore};

// Transport types
pub use hub::{HubHandle, HubServer};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use transport::{ChannelEvent, ChannelHandle, ChannelId, ChannelListener, ChannelTransport};
pub use websocket::WsTransport;
