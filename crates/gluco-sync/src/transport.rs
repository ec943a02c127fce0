//! # Channel Transport
//!
//! The session primitive sync transfers run over: a named, one-shot byte
//! stream between two peers.
//!
//! ## Channel Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Channel Lifecycle                               │
//! │                                                                         │
//! │  Opener                                      Acceptor                  │
//! │    │                                            │                       │
//! │    │ open(peer, path) ─────────────────────────►│ Opened(handle)        │
//! │    │ output_stream(id)                          │ input_stream(id)      │
//! │    │ write ... flush ... shutdown ─── bytes ───►│ read to EOF           │
//! │    │ close(id) ────────────────────────────────►│ InputClosed           │
//! │    │                                            │ OutputClosed          │
//! │    │                                            │ close(id)             │
//! │                                                                         │
//! │  Channel ids are process-wide and monotonic: a closed id never comes   │
//! │  back, so a late event can always be told apart from a fresh one.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Implementations: [`crate::memory::MemoryTransport`] (in-process, tests and
//! embedding) and [`crate::websocket::WsTransport`] (network).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{SyncError, SyncResult};

/// Readable half of a channel.
pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable half of a channel.
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

// =============================================================================
// Close Reasons
// =============================================================================

/// The channel was closed normally by one side.
pub const CLOSE_REASON_NORMAL: i32 = 0;

/// The underlying connection to the peer dropped.
pub const CLOSE_REASON_DISCONNECTED: i32 = 1;

/// The remote side closed the channel.
pub const CLOSE_REASON_REMOTE_CLOSE: i32 = 2;

/// The local side closed the channel.
pub const CLOSE_REASON_LOCAL_CLOSE: i32 = 3;

// =============================================================================
// Channel Identity
// =============================================================================

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one channel, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocates a fresh id.
    pub fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// An open channel as seen from one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    /// Local id of the channel.
    pub id: ChannelId,

    /// Device id of the other side.
    pub peer: String,

    /// Channel path (e.g. `/gdh_db_sync`).
    pub path: String,
}

// =============================================================================
// Events
// =============================================================================

/// Notification delivered to registered listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A peer opened a channel to this node.
    Opened(ChannelHandle),

    /// No more input will arrive on the channel.
    InputClosed {
        channel: ChannelHandle,
        close_reason: i32,
        app_code: i32,
    },

    /// The channel no longer accepts output.
    OutputClosed {
        channel: ChannelHandle,
        close_reason: i32,
        app_code: i32,
    },
}

impl ChannelEvent {
    /// The channel the event refers to.
    pub fn channel(&self) -> &ChannelHandle {
        match self {
            ChannelEvent::Opened(channel) => channel,
            ChannelEvent::InputClosed { channel, .. } => channel,
            ChannelEvent::OutputClosed { channel, .. } => channel,
        }
    }
}

/// Receives channel events.
///
/// Called on the transport's dispatcher task; implementations must not
/// block.
pub trait ChannelListener: Send + Sync {
    fn on_channel_event(&self, event: ChannelEvent);
}

// =============================================================================
// Transport Trait
// =============================================================================

/// A channel-oriented transport between peers.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Device id of this node.
    fn local_id(&self) -> &str;

    /// Opens a channel to `peer` on `path`.
    async fn open(&self, peer: &str, path: &str) -> SyncResult<ChannelHandle>;

    /// Takes the readable half of an open channel. Can be taken once.
    async fn input_stream(&self, channel: ChannelId) -> SyncResult<ChannelReader>;

    /// Takes the writable half of an open channel. Can be taken once.
    async fn output_stream(&self, channel: ChannelId) -> SyncResult<ChannelWriter>;

    /// Closes a channel. Closing an unknown or already closed channel is Ok.
    async fn close(&self, channel: ChannelId) -> SyncResult<()>;

    /// Subscribes to channel events. Registering the same listener twice is
    /// a no-op.
    fn register_listener(&self, listener: Arc<dyn ChannelListener>);

    /// Removes a listener registered earlier.
    fn unregister_listener(&self, listener: &Arc<dyn ChannelListener>);
}

// =============================================================================
// Shared Building Blocks
// =============================================================================

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn same_listener(a: &Arc<dyn ChannelListener>, b: &Arc<dyn ChannelListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

type Delivery = (Vec<Arc<dyn ChannelListener>>, ChannelEvent);

/// Registered listeners plus the task that delivers events to them.
///
/// Events are delivered in emission order to the listeners registered at
/// the time of emission, on a dedicated task, never on the emitter.
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct ListenerSet {
    listeners: Arc<Mutex<Vec<Arc<dyn ChannelListener>>>>,
    dispatch_tx: mpsc::UnboundedSender<Delivery>,
}

impl ListenerSet {
    pub fn new() -> Self {
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<Delivery>();

        tokio::spawn(async move {
            while let Some((targets, event)) = dispatch_rx.recv().await {
                for listener in targets {
                    listener.on_channel_event(event.clone());
                }
            }
        });

        ListenerSet {
            listeners: Arc::new(Mutex::new(Vec::new())),
            dispatch_tx,
        }
    }

    pub fn register(&self, listener: Arc<dyn ChannelListener>) {
        let mut listeners = lock(&self.listeners);
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn unregister(&self, listener: &Arc<dyn ChannelListener>) {
        lock(&self.listeners).retain(|l| !same_listener(l, listener));
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues an event for the currently registered listeners.
    pub fn emit(&self, event: ChannelEvent) {
        let targets = lock(&self.listeners).clone();
        if targets.is_empty() {
            trace!(channel = %event.channel().id, "No listener for channel event");
            return;
        }
        // The dispatcher only stops once every sender is gone.
        let _ = self.dispatch_tx.send((targets, event));
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

struct ChannelEntry {
    handle: ChannelHandle,
    reader: Option<ChannelReader>,
    writer: Option<ChannelWriter>,
}

/// Open channels on one node and their not-yet-taken stream halves.
#[derive(Clone, Default)]
pub struct ChannelTable {
    entries: Arc<Mutex<HashMap<ChannelId, ChannelEntry>>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: ChannelHandle, reader: ChannelReader, writer: ChannelWriter) {
        lock(&self.entries).insert(
            handle.id,
            ChannelEntry {
                handle,
                reader: Some(reader),
                writer: Some(writer),
            },
        );
    }

    pub fn take_reader(&self, id: ChannelId) -> SyncResult<ChannelReader> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(&id)
            .ok_or(SyncError::UnknownChannel(id.as_u64()))?;
        entry.reader.take().ok_or(SyncError::StreamTaken {
            channel: id.as_u64(),
            stream: "input",
        })
    }

    pub fn take_writer(&self, id: ChannelId) -> SyncResult<ChannelWriter> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(&id)
            .ok_or(SyncError::UnknownChannel(id.as_u64()))?;
        entry.writer.take().ok_or(SyncError::StreamTaken {
            channel: id.as_u64(),
            stream: "output",
        })
    }

    /// Removes a channel, dropping any stream half not yet taken.
    pub fn remove(&self, id: ChannelId) -> Option<ChannelHandle> {
        lock(&self.entries).remove(&id).map(|entry| entry.handle)
    }

    pub fn get(&self, id: ChannelId) -> Option<ChannelHandle> {
        lock(&self.entries).get(&id).map(|entry| entry.handle.clone())
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        lock(&self.entries).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
