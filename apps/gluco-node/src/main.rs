//! # GlucoSync Node Entry Point
//!
//! Runs one device of the sync topology as a headless process.
//!
//! ## Startup Sequence
//! 1. Initialize tracing (logging)
//! 2. Load `sync.toml` (plus `GLUCO_*` environment overrides)
//! 3. Determine database path (app data directory)
//! 4. Connect to database & run migrations
//! 5. Start the hub server (inbound channels and commands)
//! 6. Build the coordinator and serve commands
//! 7. Optionally request a sync, then wait for Ctrl-C
//!
//! ## Environment
//! - `GLUCO_CONFIG` - Path to the config file
//! - `GLUCO_DB_PATH` - Path to the SQLite database
//! - `GLUCO_DEVICE_ID`, `GLUCO_DEVICE_ROLE`, `GLUCO_HUB_PORT`, `GLUCO_PEERS` -
//!   Config overrides

use std::path::PathBuf;
use std::sync::Arc;

use directories::ProjectDirs;
use gluco_db::{Database, DbConfig};
use gluco_sync::{
    CoordinatorSettings, HubServer, SyncConfig, SyncCoordinatorBuilder, SyncEvent,
    SyncEventEmitter, WsTransport,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Depth of the inbound command queue.
const COMMAND_QUEUE_DEPTH: usize = 64;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting GlucoSync node");

    let config_path = std::env::var("GLUCO_CONFIG").ok().map(PathBuf::from);
    let config = SyncConfig::load_or_default(config_path);
    info!(
        device_id = %config.device_id(),
        role = %config.role(),
        peers = config.peers.len(),
        "Configuration loaded"
    );

    let db_path = get_database_path()?;
    info!(?db_path, "Database path determined");
    let db = Database::new(DbConfig::new(db_path)).await?;
    info!("Database connected and migrations applied");

    let transport = WsTransport::from_config(&config)?;
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

    let hub = if config.hub.enabled {
        let handle = HubServer::new(config.hub.clone(), transport.clone(), commands_tx)
            .start()
            .await?;
        Some(handle)
    } else {
        warn!("Hub server disabled, this node cannot receive channels");
        None
    };

    let transport = Arc::new(transport);
    let coordinator = SyncCoordinatorBuilder::new(CoordinatorSettings::from_config(&config))
        .with_transport(transport.clone())
        .with_commands(transport)
        .with_store(Arc::new(db))
        .with_emitter(Arc::new(LogEmitter))
        .build()?;

    coordinator.serve_commands(commands_rx);

    if config.sync.sync_on_start {
        coordinator.request_sync();
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    coordinator.shutdown().await?;
    if let Some(hub) = hub {
        hub.shutdown().await?;
    }

    info!("GlucoSync node stopped");
    Ok(())
}

/// Logs sync milestones at info level; the rest at debug.
struct LogEmitter;

impl SyncEventEmitter for LogEmitter {
    fn emit(&self, event: &SyncEvent) {
        match event {
            SyncEvent::Succeeded { .. } | SyncEvent::GaveUp { .. } | SyncEvent::DataSent { .. } => {
                info!(?event, "Sync event")
            }
            _ => debug!(?event, "Sync event"),
        }
    }
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=gluco_sync=trace` - Show trace for the sync engine only
/// - Default: INFO level, DEBUG for gluco crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gluco=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .init();
}

/// Determines the database file path based on the platform.
///
/// ## Platform-Specific Paths
/// - **macOS**: `~/Library/Application Support/com.glucosync.gluco-node/gluco.db`
/// - **Linux**: `~/.local/share/gluco-node/gluco.db`
///
/// ## Development Override
/// Set `GLUCO_DB_PATH` environment variable to use a custom path.
fn get_database_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("GLUCO_DB_PATH") {
        return Ok(PathBuf::from(path));
    }

    let proj_dirs = ProjectDirs::from("com", "glucosync", "gluco-node")
        .ok_or("Could not determine app data directory")?;

    let data_dir = proj_dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;

    Ok(data_dir.join("gluco.db"))
}
