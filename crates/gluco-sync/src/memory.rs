//! # In-Memory Transport
//!
//! In-process peers for tests and embedding. Channels are pairs of
//! `tokio::io::duplex` pipes; commands travel over bounded mpsc queues.
//!
//! ```text
//!   MemoryNetwork
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │  "phone" ──► NodeShared { listeners, channels, commands_tx } │
//!   │  "watch" ──► NodeShared { listeners, channels, commands_tx } │
//!   └──────────────────────────────────────────────────────────────┘
//!
//!   open("watch", path) on phone:
//!     phone.writer ══ pipe A ══► watch.reader
//!     phone.reader ◄══ pipe B ══ watch.writer
//!     watch listeners ◄── Opened(handle)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{Command, CommandEnvelope, CommandSender};
use crate::transport::{
    ChannelEvent, ChannelHandle, ChannelId, ChannelListener, ChannelReader, ChannelTable,
    ChannelTransport, ChannelWriter, ListenerSet, CLOSE_REASON_REMOTE_CLOSE,
};

/// Buffer size of each in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Depth of each node's command queue.
const COMMAND_QUEUE_DEPTH: usize = 64;

struct NodeShared {
    listeners: ListenerSet,
    channels: ChannelTable,
    commands_tx: mpsc::Sender<CommandEnvelope>,
}

/// Shared state for the memory transport network.
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<String, Arc<NodeShared>>>,
}

impl MemoryNetwork {
    /// Create a new memory network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Joins a node to the network.
    ///
    /// Returns the node's transport and the queue its inbound commands
    /// arrive on. Joining again under the same id replaces the old node.
    pub async fn create_transport(
        self: &Arc<Self>,
        node_id: impl Into<String>,
    ) -> (MemoryTransport, mpsc::Receiver<CommandEnvelope>) {
        let node_id = node_id.into();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let node = Arc::new(NodeShared {
            listeners: ListenerSet::new(),
            channels: ChannelTable::new(),
            commands_tx,
        });
        self.nodes.write().await.insert(node_id.clone(), node.clone());

        let transport = MemoryTransport {
            node_id,
            node,
            network: Arc::clone(self),
        };
        (transport, commands_rx)
    }

    /// Removes a node; later opens and commands toward it fail or skip it.
    pub async fn remove(&self, node_id: &str) {
        self.nodes.write().await.remove(node_id);
    }

    async fn node(&self, node_id: &str) -> Option<Arc<NodeShared>> {
        self.nodes.read().await.get(node_id).cloned()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }
}

/// In-memory transport implementation.
#[derive(Clone)]
pub struct MemoryTransport {
    node_id: String,
    node: Arc<NodeShared>,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    /// Number of listeners registered on this node.
    pub fn listener_count(&self) -> usize {
        self.node.listeners.len()
    }

    /// Number of channels open on this node.
    pub fn open_channels(&self) -> usize {
        self.node.channels.len()
    }

    /// Sends a command to a single peer.
    pub async fn send_command_to(&self, peer: &str, command: Command) -> SyncResult<()> {
        let node = self
            .network
            .node(peer)
            .await
            .ok_or_else(|| SyncError::PeerNotFound(peer.to_string()))?;
        node.commands_tx
            .try_send(CommandEnvelope::new(&self.node_id, command))
            .map_err(|e| SyncError::ChannelError(e.to_string()))
    }
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    fn local_id(&self) -> &str {
        &self.node_id
    }

    async fn open(&self, peer: &str, path: &str) -> SyncResult<ChannelHandle> {
        let remote = self
            .network
            .node(peer)
            .await
            .ok_or_else(|| SyncError::PeerNotFound(peer.to_string()))?;

        let id = ChannelId::next();
        let local_handle = ChannelHandle {
            id,
            peer: peer.to_string(),
            path: path.to_string(),
        };
        let remote_handle = ChannelHandle {
            id,
            peer: self.node_id.clone(),
            path: path.to_string(),
        };

        // A: local writes, remote reads. B: remote writes, local reads.
        let (a_local, a_remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (b_remote, b_local) = tokio::io::duplex(PIPE_CAPACITY);

        self.node
            .channels
            .insert(local_handle.clone(), Box::new(b_local), Box::new(a_local));
        remote
            .channels
            .insert(remote_handle.clone(), Box::new(a_remote), Box::new(b_remote));

        debug!(channel = %id, peer = %peer, path = %path, "Opened memory channel");
        remote.listeners.emit(ChannelEvent::Opened(remote_handle));

        Ok(local_handle)
    }

    async fn input_stream(&self, channel: ChannelId) -> SyncResult<ChannelReader> {
        self.node.channels.take_reader(channel)
    }

    async fn output_stream(&self, channel: ChannelId) -> SyncResult<ChannelWriter> {
        self.node.channels.take_writer(channel)
    }

    async fn close(&self, channel: ChannelId) -> SyncResult<()> {
        let handle = match self.node.channels.remove(channel) {
            Some(handle) => handle,
            None => return Ok(()),
        };
        debug!(channel = %channel, peer = %handle.peer, "Closed memory channel");

        if let Some(remote) = self.network.node(&handle.peer).await {
            if let Some(remote_handle) = remote.channels.get(channel) {
                remote.listeners.emit(ChannelEvent::InputClosed {
                    channel: remote_handle.clone(),
                    close_reason: CLOSE_REASON_REMOTE_CLOSE,
                    app_code: 0,
                });
                remote.listeners.emit(ChannelEvent::OutputClosed {
                    channel: remote_handle,
                    close_reason: CLOSE_REASON_REMOTE_CLOSE,
                    app_code: 0,
                });
            }
        }

        Ok(())
    }

    fn register_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.node.listeners.register(listener);
    }

    fn unregister_listener(&self, listener: &Arc<dyn ChannelListener>) {
        self.node.listeners.unregister(listener);
    }
}

#[async_trait]
impl CommandSender for MemoryTransport {
    async fn send_command(&self, command: Command) -> SyncResult<usize> {
        let nodes = self.network.nodes.read().await;
        let mut reached = 0;
        for (peer_id, node) in nodes.iter() {
            if peer_id == &self.node_id {
                continue;
            }
            let envelope = CommandEnvelope::new(&self.node_id, command);
            // Skip peers whose queue is full or gone.
            if node.commands_tx.try_send(envelope).is_ok() {
                reached += 1;
            }
        }
        debug!(command = %command, reached = reached, "Broadcast command");
        Ok(reached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Recorder(mpsc::UnboundedSender<ChannelEvent>);

    impl ChannelListener for Recorder {
        fn on_channel_event(&self, event: ChannelEvent) {
            let _ = self.0.send(event);
        }
    }

    #[tokio::test]
    async fn test_open_write_read_close() {
        let network = MemoryNetwork::new();
        let (phone, _phone_rx) = network.create_transport("phone").await;
        let (watch, _watch_rx) = network.create_transport("watch").await;

        let (tx, mut events) = mpsc::unbounded_channel();
        let recorder: Arc<dyn ChannelListener> = Arc::new(Recorder(tx));
        phone.register_listener(recorder.clone());

        let handle = watch.open("phone", "/gdh_db_sync").await.unwrap();
        let opened = events.recv().await.unwrap();
        assert_eq!(
            opened,
            ChannelEvent::Opened(ChannelHandle {
                id: handle.id,
                peer: "watch".into(),
                path: "/gdh_db_sync".into(),
            })
        );

        let mut writer = watch.output_stream(handle.id).await.unwrap();
        writer.write_all(b"[]").await.unwrap();
        writer.shutdown().await.unwrap();
        watch.close(handle.id).await.unwrap();

        let mut reader = phone.input_stream(handle.id).await.unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "[]");

        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::InputClosed { close_reason: CLOSE_REASON_REMOTE_CLOSE, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::OutputClosed { .. }
        ));

        phone.close(handle.id).await.unwrap();
        phone.close(handle.id).await.unwrap();
        assert_eq!(phone.open_channels(), 0);
        assert_eq!(watch.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_open_unknown_peer() {
        let network = MemoryNetwork::new();
        let (phone, _rx) = network.create_transport("phone").await;

        let err = phone.open("car", "/gdh_db_sync").await.unwrap_err();
        assert!(matches!(err, SyncError::PeerNotFound(ref p) if p == "car"));
    }

    #[tokio::test]
    async fn test_broadcast_skips_self() {
        let network = MemoryNetwork::new();
        let (phone, mut phone_rx) = network.create_transport("phone").await;
        let (_watch, mut watch_rx) = network.create_transport("watch").await;
        let (_car, mut car_rx) = network.create_transport("car").await;

        assert_eq!(phone.send_command(Command::DbSync).await.unwrap(), 2);
        assert_eq!(watch_rx.recv().await.unwrap().from, "phone");
        assert_eq!(car_rx.recv().await.unwrap().command, Command::DbSync);
        assert!(phone_rx.try_recv().is_err());

        network.remove("car").await;
        assert_eq!(phone.send_command(Command::RequestDbSync).await.unwrap(), 1);
        assert!(phone.send_command_to("car", Command::DbSync).await.is_err());
    }
}
