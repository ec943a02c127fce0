//! # Hub Server
//!
//! The WebSocket endpoint peers connect to: inbound channels and commands.
//!
//! ## Routes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Hub Server                                    │
//! │                                                                         │
//! │  GET /channel?from=<peer>&path=<path>   upgrade ─► WsTransport         │
//! │                                         (Opened to channel listeners)   │
//! │                                                                         │
//! │  GET /command                           upgrade ─► Text frames          │
//! │                                         CommandEnvelope ─► commands_tx  │
//! │                                                                         │
//! │  GET /health                            "OK"                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HubSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::CommandEnvelope;
use crate::websocket::WsTransport;

/// Maximum message size (1MB).
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

// =============================================================================
// Hub State
// =============================================================================

struct HubState {
    transport: WsTransport,
    commands_tx: mpsc::Sender<CommandEnvelope>,
}

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    from: String,
    path: String,
}

// =============================================================================
// Hub Server
// =============================================================================

/// Serves inbound channels and commands for one node.
pub struct HubServer {
    settings: HubSettings,
    state: Arc<HubState>,
}

/// Handle for controlling the hub server.
#[derive(Clone)]
pub struct HubHandle {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl HubHandle {
    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shuts down the hub server.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Hub shutdown channel closed".into()))
    }
}

impl HubServer {
    /// Creates a hub that hands channels to `transport` and commands to
    /// `commands_tx`.
    pub fn new(
        settings: HubSettings,
        transport: WsTransport,
        commands_tx: mpsc::Sender<CommandEnvelope>,
    ) -> Self {
        HubServer {
            settings,
            state: Arc::new(HubState {
                transport,
                commands_tx,
            }),
        }
    }

    /// Binds and starts serving. Returns once the listener is bound.
    pub async fn start(self) -> SyncResult<HubHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let app = Router::new()
            .route("/channel", get(channel_handler))
            .route("/command", get(command_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone());

        let bind_addr = self.settings.bind_address();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Hub server started");

        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                    info!("Hub server shutting down");
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "Hub server stopped with error");
            }
        });

        Ok(HubHandle {
            local_addr,
            shutdown_tx,
        })
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// Upgrades a channel request and hands the socket to the transport.
async fn channel_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ChannelQuery>,
    State(state): State<Arc<HubState>>,
) -> impl IntoResponse {
    debug!(peer = %query.from, path = %query.path, "Channel upgrade requested");
    ws.on_upgrade(move |socket| async move {
        state.transport.attach_inbound(query.from, query.path, socket);
    })
}

/// Upgrades a command connection.
async fn command_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_command_socket(socket, state))
}

/// Forwards every command on the socket until it closes.
async fn handle_command_socket(mut socket: WebSocket, state: Arc<HubState>) {
    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => match CommandEnvelope::from_json(text.as_str()) {
                Ok(envelope) => {
                    debug!(command = %envelope.command, from = %envelope.from, "Command received");
                    if state.commands_tx.send(envelope).await.is_err() {
                        warn!("Command receiver dropped");
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "Invalid command message"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Command socket error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::coordinator::{CoordinatorSettings, SyncCoordinator};
    use crate::protocol::{Command, CommandSender};
    use crate::store::MemoryRecordStore;
    use crate::transport::{ChannelEvent, ChannelListener, ChannelTransport};
    use crate::websocket::DEFAULT_CONNECT_TIMEOUT;
    use gluco_core::{now_ms, DeviceRole, GlucoseRecord, DB_SYNC_CHANNEL_PATH};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Recorder(mpsc::UnboundedSender<ChannelEvent>);

    impl ChannelListener for Recorder {
        fn on_channel_event(&self, event: ChannelEvent) {
            let _ = self.0.send(event);
        }
    }

    fn local_settings() -> HubSettings {
        HubSettings {
            enabled: true,
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
        }
    }

    struct Node {
        transport: WsTransport,
        hub: HubHandle,
        commands_rx: mpsc::Receiver<CommandEnvelope>,
    }

    async fn start_node(id: &str) -> Node {
        let transport = WsTransport::new(id, &[], DEFAULT_CONNECT_TIMEOUT).unwrap();
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let hub = HubServer::new(local_settings(), transport.clone(), commands_tx)
            .start()
            .await
            .unwrap();
        Node {
            transport,
            hub,
            commands_rx,
        }
    }

    async fn link(a: &Node, a_id: &str, b: &Node, b_id: &str) {
        a.transport
            .add_peer(&PeerConfig::new(b_id, format!("ws://{}", b.hub.local_addr())))
            .unwrap();
        b.transport
            .add_peer(&PeerConfig::new(a_id, format!("ws://{}", a.hub.local_addr())))
            .unwrap();
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let node = start_node("phone").await;

        let mut stream = tokio::net::TcpStream::connect(node.hub.local_addr()).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("OK"));
        node.hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_and_channels_over_websocket() {
        let phone = start_node("phone").await;
        let mut watch = start_node("watch").await;
        link(&phone, "phone", &watch, "watch").await;

        assert_eq!(phone.transport.send_command(Command::DbSync).await.unwrap(), 1);
        let envelope = watch.commands_rx.recv().await.unwrap();
        assert_eq!(envelope.from, "phone");
        assert_eq!(envelope.command, Command::DbSync);

        let (tx, mut events) = mpsc::unbounded_channel();
        watch.transport.register_listener(Arc::new(Recorder(tx)));

        let handle = phone.transport.open("watch", DB_SYNC_CHANNEL_PATH).await.unwrap();
        let mut writer = phone.transport.output_stream(handle.id).await.unwrap();
        writer.write_all(b"[{\"timestamp\":1,\"value\":100}]").await.unwrap();
        writer.shutdown().await.unwrap();

        let opened = match events.recv().await.unwrap() {
            ChannelEvent::Opened(handle) => handle,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(opened.peer, "phone");
        assert_eq!(opened.path, DB_SYNC_CHANNEL_PATH);

        let mut reader = watch.transport.input_stream(opened.id).await.unwrap();
        let mut payload = String::new();
        reader.read_to_string(&mut payload).await.unwrap();
        assert_eq!(payload, "[{\"timestamp\":1,\"value\":100}]");

        let closed = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(closed, ChannelEvent::InputClosed { .. }));

        phone.transport.close(handle.id).await.unwrap();
        watch.transport.close(opened.id).await.unwrap();
        assert_eq!(watch.transport.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_coordinators_sync_over_websocket() {
        let mut phone = start_node("phone").await;
        let mut watch = start_node("watch").await;
        link(&phone, "phone", &watch, "watch").await;

        let now = now_ms();
        let records = (1..=5).map(|n| GlucoseRecord::new(now - n * 60_000, 100 + n as i32));
        let watch_store = Arc::new(MemoryRecordStore::with_records(records));
        let phone_store = Arc::new(MemoryRecordStore::new());

        let phone_sync = SyncCoordinator::new(
            CoordinatorSettings::new("phone", DeviceRole::Other),
            Arc::new(phone.transport.clone()),
            Arc::new(phone.transport.clone()),
            phone_store.clone(),
        );
        let watch_sync = SyncCoordinator::new(
            CoordinatorSettings::new("watch", DeviceRole::Wearable),
            Arc::new(watch.transport.clone()),
            Arc::new(watch.transport.clone()),
            watch_store,
        );
        phone_sync.serve_commands(std::mem::replace(&mut phone.commands_rx, mpsc::channel(1).1));
        watch_sync.serve_commands(std::mem::replace(&mut watch.commands_rx, mpsc::channel(1).1));

        assert!(phone_sync.request_sync());
        tokio::time::timeout(Duration::from_secs(8), async {
            while phone_sync.is_syncing() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(phone_store.len().await, 5);
        assert_eq!(
            phone_sync.status().last_outcome,
            Some(crate::coordinator::SyncOutcome::Succeeded)
        );

        phone.hub.shutdown().await.unwrap();
        watch.hub.shutdown().await.unwrap();
    }
}
