//! # WebSocket Transport
//!
//! Channels and commands between devices on a network.
//!
//! ## Wire Mapping
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      One Channel = One WebSocket                        │
//! │                                                                         │
//! │  Opener (WsTransport)                    Acceptor (HubServer)          │
//! │                                                                         │
//! │  GET {peer}/channel?from=<id>&path=<p> ──► upgrade, Opened(handle)     │
//! │                                                                         │
//! │  output_stream ─► pump_out ── Binary ───► pump_in ─► input_stream      │
//! │  shutdown()    ─► pump_out ── Close  ───► pump_in ─► EOF              │
//! │                                           InputClosed + OutputClosed    │
//! │                                                                         │
//! │  Commands: GET {peer}/command, one Text frame (CommandEnvelope JSON)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each side bridges its socket to a pair of in-process pipes, so callers
//! see the same `AsyncRead`/`AsyncWrite` halves as with any transport.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::future::join_all;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{PeerConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{Command, CommandEnvelope, CommandSender};
use crate::transport::{
    ChannelEvent, ChannelHandle, ChannelId, ChannelListener, ChannelReader, ChannelTable,
    ChannelTransport, ChannelWriter, ListenerSet, CLOSE_REASON_DISCONNECTED,
    CLOSE_REASON_REMOTE_CLOSE,
};
use crate::transport::{read_lock, write_lock};

/// Buffer size of the pipes bridging a socket.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Largest binary frame written.
const CHUNK_SIZE: usize = 16 * 1024;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Frame Bridge
// =============================================================================

/// What an incoming WebSocket message means for the channel.
enum Frame {
    Data(Vec<u8>),
    Close,
    Skip,
}

fn client_frame(msg: WsMessage) -> Frame {
    match msg {
        WsMessage::Binary(bytes) => Frame::Data(bytes.to_vec()),
        WsMessage::Close(_) => Frame::Close,
        _ => Frame::Skip,
    }
}

fn client_data(bytes: Vec<u8>) -> WsMessage {
    WsMessage::Binary(bytes.into())
}

fn server_frame(msg: AxumMessage) -> Frame {
    match msg {
        AxumMessage::Binary(bytes) => Frame::Data(bytes.to_vec()),
        AxumMessage::Close(_) => Frame::Close,
        _ => Frame::Skip,
    }
}

fn server_data(bytes: Vec<u8>) -> AxumMessage {
    AxumMessage::Binary(bytes.into())
}

/// Copies incoming frames into the local read pipe until the peer closes.
///
/// Returns the close reason: a close frame is a remote close, anything else
/// a dropped connection.
async fn pump_in<R, M, E>(mut stream: R, mut pipe: DuplexStream, channel: ChannelId, decode: fn(M) -> Frame) -> i32
where
    R: Stream<Item = Result<M, E>> + Unpin,
    E: Display,
{
    let mut reason = CLOSE_REASON_DISCONNECTED;
    while let Some(next) = stream.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                debug!(channel = %channel, error = %e, "Channel socket error");
                break;
            }
        };
        match decode(msg) {
            Frame::Data(bytes) => {
                if let Err(e) = pipe.write_all(&bytes).await {
                    debug!(channel = %channel, error = %e, "Channel reader gone");
                    break;
                }
            }
            Frame::Close => {
                reason = CLOSE_REASON_REMOTE_CLOSE;
                break;
            }
            Frame::Skip => {}
        }
    }
    let _ = pipe.shutdown().await;
    reason
}

/// Sends whatever is written to the local write pipe, then a close frame.
async fn pump_out<W, M>(mut sink: W, mut pipe: DuplexStream, channel: ChannelId, encode: fn(Vec<u8>) -> M, close: M)
where
    W: Sink<M> + Unpin,
    W::Error: Display + Send,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = sink.send(encode(buf[..n].to_vec())).await {
                    debug!(channel = %channel, error = %e, "Channel socket closed while sending");
                    return;
                }
            }
            Err(e) => {
                debug!(channel = %channel, error = %e, "Channel writer failed");
                break;
            }
        }
    }
    if let Err(e) = sink.send(close).await {
        debug!(channel = %channel, error = %e, "Close frame not delivered");
    }
}

// =============================================================================
// Transport
// =============================================================================

struct WsInner {
    local_id: String,
    peers: RwLock<HashMap<String, Url>>,
    listeners: ListenerSet,
    channels: ChannelTable,
    connect_timeout: Duration,
}

impl WsInner {
    fn spawn_channel<W, R, M, E>(
        self: &Arc<Self>,
        handle: ChannelHandle,
        sink: W,
        stream: R,
        decode: fn(M) -> Frame,
        encode: fn(Vec<u8>) -> M,
        close: M,
    ) where
        W: Sink<M> + Unpin + Send + 'static,
        W::Error: Display + Send,
        R: Stream<Item = Result<M, E>> + Unpin + Send + 'static,
        M: Send + 'static,
        E: Display + Send + 'static,
    {
        let (in_local, in_pump) = tokio::io::duplex(PIPE_CAPACITY);
        let (out_local, out_pump) = tokio::io::duplex(PIPE_CAPACITY);
        self.channels
            .insert(handle.clone(), Box::new(in_local), Box::new(out_local));

        let id = handle.id;
        tokio::spawn(pump_out(sink, out_pump, id, encode, close));

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let reason = pump_in(stream, in_pump, id, decode).await;
            inner.on_remote_closed(id, reason);
        });
    }

    fn on_remote_closed(&self, id: ChannelId, close_reason: i32) {
        // Already closed locally: nobody is interested any more.
        let handle = match self.channels.get(id) {
            Some(handle) => handle,
            None => return,
        };
        debug!(channel = %id, peer = %handle.peer, close_reason, "Peer closed channel");
        self.listeners.emit(ChannelEvent::InputClosed {
            channel: handle.clone(),
            close_reason,
            app_code: 0,
        });
        self.listeners.emit(ChannelEvent::OutputClosed {
            channel: handle,
            close_reason,
            app_code: 0,
        });
    }
}

/// WebSocket channel transport and command sender.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<WsInner>,
}

impl WsTransport {
    /// Creates a transport for `local_id` that can reach `peers`.
    pub fn new(
        local_id: impl Into<String>,
        peers: &[PeerConfig],
        connect_timeout: Duration,
    ) -> SyncResult<Self> {
        let transport = WsTransport {
            inner: Arc::new(WsInner {
                local_id: local_id.into(),
                peers: RwLock::new(HashMap::new()),
                listeners: ListenerSet::new(),
                channels: ChannelTable::new(),
                connect_timeout,
            }),
        };
        for peer in peers {
            transport.add_peer(peer)?;
        }
        Ok(transport)
    }

    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        Self::new(config.device_id(), &config.peers, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Adds or replaces a peer.
    pub fn add_peer(&self, peer: &PeerConfig) -> SyncResult<()> {
        let url = Url::parse(&peer.url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(SyncError::InvalidUrl(format!(
                "Peer URL must start with ws:// or wss://, got: {}",
                peer.url
            )));
        }
        write_lock(&self.inner.peers).insert(peer.id.clone(), url);
        Ok(())
    }

    pub fn peer_ids(&self) -> Vec<String> {
        read_lock(&self.inner.peers)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of channels open on this node.
    pub fn open_channels(&self) -> usize {
        self.inner.channels.len()
    }

    /// Builds `{peer base}/{endpoint}?{query}`.
    fn endpoint_url(&self, peer: &str, endpoint: &str, query: &[(&str, &str)]) -> SyncResult<Url> {
        let mut url = read_lock(&self.inner.peers)
            .get(peer)
            .cloned()
            .ok_or_else(|| SyncError::PeerNotFound(peer.to_string()))?;

        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(format!("URL of peer {} cannot be a base", peer)))?
            .pop_if_empty()
            .push(endpoint);

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn connect(&self, url: &Url) -> SyncResult<ClientSocket> {
        match timeout(self.inner.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((socket, response))) => {
                debug!(url = %url, status = ?response.status(), "WebSocket handshake complete");
                Ok(socket)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(self.inner.connect_timeout.as_secs())),
        }
    }

    async fn deliver(&self, peer: &str, json: &str) -> SyncResult<()> {
        let url = self.endpoint_url(peer, "command", &[])?;
        let mut socket = self.connect(&url).await?;
        socket.send(WsMessage::Text(json.to_string().into())).await?;
        socket.close(None).await?;
        Ok(())
    }

    /// Adopts a channel a peer opened through the hub.
    pub fn attach_inbound(&self, peer: String, path: String, socket: WebSocket) -> ChannelHandle {
        let handle = ChannelHandle {
            id: ChannelId::next(),
            peer,
            path,
        };
        let (sink, stream) = socket.split();
        self.inner.spawn_channel(
            handle.clone(),
            sink,
            stream,
            server_frame,
            server_data,
            AxumMessage::Close(None),
        );

        info!(channel = %handle.id, peer = %handle.peer, path = %handle.path, "Inbound channel opened");
        self.inner.listeners.emit(ChannelEvent::Opened(handle.clone()));
        handle
    }
}

#[async_trait]
impl ChannelTransport for WsTransport {
    fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    async fn open(&self, peer: &str, path: &str) -> SyncResult<ChannelHandle> {
        let url = self.endpoint_url(
            peer,
            "channel",
            &[("from", self.inner.local_id.as_str()), ("path", path)],
        )?;
        let socket = self.connect(&url).await?;

        let handle = ChannelHandle {
            id: ChannelId::next(),
            peer: peer.to_string(),
            path: path.to_string(),
        };
        let (sink, stream) = socket.split();
        self.inner.spawn_channel(
            handle.clone(),
            sink,
            stream,
            client_frame,
            client_data,
            WsMessage::Close(None),
        );

        debug!(channel = %handle.id, peer = %peer, path = %path, "Opened WebSocket channel");
        Ok(handle)
    }

    async fn input_stream(&self, channel: ChannelId) -> SyncResult<ChannelReader> {
        self.inner.channels.take_reader(channel)
    }

    async fn output_stream(&self, channel: ChannelId) -> SyncResult<ChannelWriter> {
        self.inner.channels.take_writer(channel)
    }

    async fn close(&self, channel: ChannelId) -> SyncResult<()> {
        // Dropping untaken halves lets the pumps wind down on their own.
        if self.inner.channels.remove(channel).is_some() {
            debug!(channel = %channel, "Closed WebSocket channel");
        }
        Ok(())
    }

    fn register_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.inner.listeners.register(listener);
    }

    fn unregister_listener(&self, listener: &Arc<dyn ChannelListener>) {
        self.inner.listeners.unregister(listener);
    }
}

#[async_trait]
impl CommandSender for WsTransport {
    async fn send_command(&self, command: Command) -> SyncResult<usize> {
        let json = CommandEnvelope::new(&self.inner.local_id, command).to_json()?;
        let peers = self.peer_ids();

        let results = join_all(peers.iter().map(|peer| self.deliver(peer, &json))).await;

        let mut reached = 0;
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(()) => reached += 1,
                Err(e) => warn!(peer = %peer, command = %command, error = %e, "Peer unreachable"),
            }
        }
        debug!(command = %command, reached, "Sent command");
        Ok(reached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(peers: &[PeerConfig]) -> WsTransport {
        WsTransport::new("phone", peers, DEFAULT_CONNECT_TIMEOUT).unwrap()
    }

    #[tokio::test]
    async fn test_endpoint_urls() {
        let t = transport(&[
            PeerConfig::new("watch", "ws://10.0.0.2:8765"),
            PeerConfig::new("car", "ws://10.0.0.3:8765/gluco/"),
        ]);

        let url = t
            .endpoint_url("watch", "channel", &[("from", "phone"), ("path", "/gdh_db_sync")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "ws://10.0.0.2:8765/channel?from=phone&path=%2Fgdh_db_sync"
        );

        let url = t.endpoint_url("car", "command", &[]).unwrap();
        assert_eq!(url.as_str(), "ws://10.0.0.3:8765/gluco/command");

        assert!(matches!(
            t.endpoint_url("band", "command", &[]),
            Err(SyncError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_non_websocket_peers() {
        let err = WsTransport::new(
            "phone",
            &[PeerConfig::new("watch", "http://10.0.0.2")],
            DEFAULT_CONNECT_TIMEOUT,
        )
        .err()
        .unwrap();
        assert!(matches!(err, SyncError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_skipped() {
        // Nothing listens on the discard port.
        let t = transport(&[PeerConfig::new("watch", "ws://127.0.0.1:9")]);
        assert_eq!(t.send_command(Command::DbSync).await.unwrap(), 0);
        assert!(t.open("watch", "/gdh_db_sync").await.is_err());
        assert!(t.close(ChannelId::next()).await.is_ok());
    }
}
