//! # Sync Coordinator
//!
//! Owns the sync session: channel registration, the bounded wait for the
//! peer's data, retries, and chained propagation.
//!
//! ## Request Chain
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         request_sync()                                  │
//! │                                                                         │
//! │  chain task alive? ──yes──► no-op                                      │
//! │       │ no                                                              │
//! │       ▼                                                                 │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ begin session N: close stale remnants, register listener,       │  │
//! │  │                  fresh completion flag                          │  │
//! │  │ broadcast DB_SYNC                                                │  │
//! │  │ WAITING: flag set within poll_interval * max_polls?              │  │
//! │  │ close session N: unregister listener, close channel              │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │       │                         │                        │              │
//! │   SUCCEEDED               FAILED_RETRY              FAILED_FINAL        │
//! │       │                  retry < max_retries      retry == max_retries  │
//! │       │                  sleep backoff, retry+1          │              │
//! │       │                  back to begin session           │              │
//! │       ▼                                                  ▼              │
//! │  propagate (Phone role: broadcast REQUEST_DB_SYNC)  ◄────┘              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Session State
//! All session fields live in one [`SessionState`] behind a single mutex
//! that is never held across an await. The completion flag is a per-session
//! `watch` channel: only the reader accepted into that session holds a path
//! to its sender, and the waiter awaits it with a timeout. A second flag
//! cancels that reader when the session closes, so no reader outlives its
//! session.
//!
//! Channel callbacks arrive on the transport's dispatcher task and never
//! block; reading, writing and importing happen on spawned tasks (see
//! `inbound.rs` and `outbound.rs`).

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use gluco_core::{now_ms, DeviceRole, RetentionPolicy, DB_SYNC_CHANNEL_PATH};
use gluco_db::ImportReport;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::outbound::SendReport;
use crate::protocol::{Command, CommandEnvelope, CommandSender};
use crate::store::RecordStore;
use crate::transport::{lock, ChannelEvent, ChannelHandle, ChannelId, ChannelListener, ChannelTransport};

// =============================================================================
// Policy and Settings
// =============================================================================

/// Bounded wait and retry budget for one request chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Granularity of the completion wait.
    pub poll_interval: Duration,

    /// Polls before an attempt times out.
    pub max_polls: u32,

    /// Restarts after the first timed-out attempt.
    pub max_retries: u32,

    /// Pause before each restart.
    pub retry_backoff: Duration,
}

impl WaitPolicy {
    /// Longest a single attempt waits for completion.
    pub fn max_wait(&self) -> Duration {
        self.poll_interval * self.max_polls
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy {
            poll_interval: Duration::from_secs(1),
            max_polls: 10,
            max_retries: 3,
            retry_backoff: Duration::from_secs(10),
        }
    }
}

/// Everything the coordinator needs to know about this device.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub device_id: String,
    pub role: DeviceRole,
    pub channel_path: String,
    pub wait: WaitPolicy,
    pub retention: RetentionPolicy,
}

impl CoordinatorSettings {
    /// Settings with the default path, wait policy and retention windows.
    pub fn new(device_id: impl Into<String>, role: DeviceRole) -> Self {
        CoordinatorSettings {
            device_id: device_id.into(),
            role,
            channel_path: DB_SYNC_CHANNEL_PATH.to_string(),
            wait: WaitPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        CoordinatorSettings {
            device_id: config.device_id().to_string(),
            role: config.role(),
            channel_path: config.sync.channel_path.clone(),
            wait: config.wait_policy(),
            retention: config.retention_policy(),
        }
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

// =============================================================================
// Events and Status
// =============================================================================

/// How a request chain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Succeeded,
    GaveUp,
    Cancelled,
}

/// Something observable happened in the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SessionStarted { session_id: u64, retry_count: u32 },
    ChannelAccepted { session_id: u64, channel: ChannelId, peer: String },
    ChannelRejected { channel: ChannelId, peer: String },
    ImportCompleted { session_id: u64, report: ImportReport },
    ImportFailed { session_id: u64, error: String },
    Succeeded { session_id: u64, retry_count: u32 },
    TimedOut { session_id: u64, retry_count: u32 },
    RetryScheduled { retry_count: u32, delay: Duration },
    GaveUp { retry_count: u32 },
    Propagated { reached: usize },
    DataSent { peer: String, bytes: usize, pruned: u64 },
    SendFailed { peer: String, error: String },
}

/// Receives coordinator events (UI bridges, metrics, tests).
pub trait SyncEventEmitter: Send + Sync {
    fn emit(&self, event: &SyncEvent);
}

/// No-op event emitter.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit(&self, _event: &SyncEvent) {}
}

/// Snapshot of the coordinator state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// A request chain task is alive.
    pub active: bool,
    pub session_id: Option<u64>,
    pub retry_count: u32,
    /// The session listener is subscribed to channel events.
    pub registered: bool,
    pub channel: Option<ChannelId>,
    pub last_outcome: Option<SyncOutcome>,
    pub last_success_ms: Option<i64>,
    pub sessions_started: u64,
}

// =============================================================================
// Session State
// =============================================================================

pub(crate) struct Session {
    pub(crate) id: u64,
    pub(crate) retry_count: u32,
    pub(crate) registered: bool,
    pub(crate) channel: Option<ChannelHandle>,
    pub(crate) reader_active: bool,
    pub(crate) completion_tx: watch::Sender<bool>,
    /// Flipped when the session closes; the accepted reader stops on it.
    pub(crate) cancel_tx: watch::Sender<bool>,
}

#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) session: Option<Session>,
    next_session_id: u64,
    sessions_started: u64,
    last_outcome: Option<SyncOutcome>,
    last_success_ms: Option<i64>,
}

pub(crate) struct Inner {
    pub(crate) settings: CoordinatorSettings,
    pub(crate) transport: Arc<dyn ChannelTransport>,
    pub(crate) commands: Arc<dyn CommandSender>,
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) emitter: Arc<dyn SyncEventEmitter>,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) listener: Arc<dyn ChannelListener>,
    chain: Mutex<Option<JoinHandle<()>>>,
}

/// The coordinator's subscription to transport events.
struct SessionListener {
    inner: Weak<Inner>,
}

impl ChannelListener for SessionListener {
    fn on_channel_event(&self, event: ChannelEvent) {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };

        let channel = event.channel();
        if channel.path != inner.settings.channel_path {
            trace!(channel = %channel.id, path = %channel.path, "Ignoring channel on foreign path");
            return;
        }

        match event {
            ChannelEvent::Opened(handle) => inner.on_channel_opened(handle),
            ChannelEvent::InputClosed {
                channel,
                close_reason,
                app_code,
            } => inner.on_input_closed(channel, close_reason, app_code),
            ChannelEvent::OutputClosed {
                channel,
                close_reason,
                app_code,
            } => inner.on_output_closed(channel, close_reason, app_code),
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// The sync coordinator service.
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Creates a coordinator with a no-op event emitter.
    pub fn new(
        settings: CoordinatorSettings,
        transport: Arc<dyn ChannelTransport>,
        commands: Arc<dyn CommandSender>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self::with_emitter(settings, transport, commands, store, Arc::new(NoOpEmitter))
    }

    /// Creates a coordinator with a custom event emitter.
    pub fn with_emitter(
        settings: CoordinatorSettings,
        transport: Arc<dyn ChannelTransport>,
        commands: Arc<dyn CommandSender>,
        store: Arc<dyn RecordStore>,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            settings,
            transport,
            commands,
            store,
            emitter,
            state: Mutex::new(SessionState::default()),
            listener: Arc::new(SessionListener {
                inner: weak.clone(),
            }),
            chain: Mutex::new(None),
        });
        SyncCoordinator { inner }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    /// Asks the peers for their data. Returns immediately.
    ///
    /// Returns false (and does nothing) if a request chain is already
    /// running.
    pub fn request_sync(&self) -> bool {
        self.request_sync_with_retry(0)
    }

    /// Like [`request_sync`](Self::request_sync) with the retry counter
    /// starting at `retry_count`.
    pub fn request_sync_with_retry(&self, retry_count: u32) -> bool {
        let mut chain = lock(&self.inner.chain);
        if chain.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Sync already in progress, ignoring request");
            return false;
        }

        let inner = Arc::clone(&self.inner);
        *chain = Some(tokio::spawn(async move {
            inner.run_chain(retry_count).await;
        }));
        true
    }

    /// Returns true while a request chain is running.
    pub fn is_syncing(&self) -> bool {
        lock(&self.inner.chain)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn status(&self) -> SyncStatus {
        let active = self.is_syncing();
        let state = lock(&self.inner.state);
        let session = state.session.as_ref();
        SyncStatus {
            active,
            session_id: session.map(|s| s.id),
            retry_count: session.map(|s| s.retry_count).unwrap_or(0),
            registered: session.is_some_and(|s| s.registered),
            channel: session.and_then(|s| s.channel.as_ref().map(|c| c.id)),
            last_outcome: state.last_outcome,
            last_success_ms: state.last_success_ms,
            sessions_started: state.sessions_started,
        }
    }

    /// Pushes this device's data to `peer` on a background task.
    pub fn send_data(&self, peer: impl Into<String>) -> JoinHandle<()> {
        self.inner.send_data(peer.into())
    }

    /// Pushes this device's data to `peer` and waits for the result.
    pub async fn push_to(&self, peer: &str) -> SyncResult<SendReport> {
        self.inner.push_to(peer).await
    }

    /// Reacts to a command received from a peer.
    pub fn handle_command(&self, envelope: &CommandEnvelope) {
        if envelope.from == self.inner.settings.device_id {
            trace!("Ignoring own command");
            return;
        }

        debug!(command = %envelope.command, from = %envelope.from, "Received command");
        match envelope.command {
            Command::DbSync => {
                self.send_data(envelope.from.clone());
            }
            Command::RequestDbSync => {
                self.request_sync();
            }
        }
    }

    /// Handles commands from `commands_rx` until the queue closes.
    pub fn serve_commands(&self, mut commands_rx: mpsc::Receiver<CommandEnvelope>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = commands_rx.recv().await {
                coordinator.handle_command(&envelope);
            }
            debug!("Command queue closed");
        })
    }

    /// Aborts the running chain and closes its session.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let chain = lock(&self.inner.chain).take();
        let was_running = match chain {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                // The chain may be mid-poll; let it stop before reading the session.
                let _ = handle.await;
                running
            }
            None => false,
        };

        let session_id = lock(&self.inner.state).session.as_ref().map(|s| s.id);
        if let Some(session_id) = session_id {
            self.inner.close_session(session_id).await;
        }

        if was_running {
            lock(&self.inner.state).last_outcome = Some(SyncOutcome::Cancelled);
            info!("Sync chain cancelled");
        }

        Ok(())
    }
}

// =============================================================================
// Request Chain
// =============================================================================

impl Inner {
    async fn run_chain(self: Arc<Self>, start_retry: u32) {
        let wait = self.settings.wait.clone();
        let mut backoff = Constant::new(wait.retry_backoff);
        let mut retry_count = start_retry.min(wait.max_retries);

        loop {
            let (session_id, mut completion_rx) = self.begin_session(retry_count).await;
            self.emitter.emit(&SyncEvent::SessionStarted {
                session_id,
                retry_count,
            });

            match self.commands.send_command(Command::DbSync).await {
                Ok(reached) => debug!(session_id, reached, "Asked peers for their data"),
                Err(e) => warn!(session_id, error = %e, "Failed to send DB_SYNC"),
            }

            let completed = tokio::time::timeout(wait.max_wait(), completion_rx.wait_for(|done| *done))
                .await
                .map(|flag| flag.is_ok())
                .unwrap_or(false);

            self.close_session(session_id).await;

            if completed {
                info!(session_id, retry_count, "Sync completed");
                {
                    let mut state = lock(&self.state);
                    state.last_outcome = Some(SyncOutcome::Succeeded);
                    state.last_success_ms = Some(now_ms());
                }
                self.emitter.emit(&SyncEvent::Succeeded {
                    session_id,
                    retry_count,
                });
                self.propagate().await;
                return;
            }

            warn!(
                session_id,
                retry_count,
                waited_ms = wait.max_wait().as_millis() as u64,
                "Sync attempt timed out"
            );
            self.emitter.emit(&SyncEvent::TimedOut {
                session_id,
                retry_count,
            });

            if retry_count >= wait.max_retries {
                break;
            }

            let delay = backoff.next_backoff().unwrap_or(wait.retry_backoff);
            retry_count += 1;
            info!(retry_count, delay_secs = delay.as_secs(), "Retrying sync");
            self.emitter.emit(&SyncEvent::RetryScheduled { retry_count, delay });
            tokio::time::sleep(delay).await;
        }

        warn!(retry_count, "Sync retries exhausted, giving up");
        lock(&self.state).last_outcome = Some(SyncOutcome::GaveUp);
        self.emitter.emit(&SyncEvent::GaveUp { retry_count });
        self.propagate().await;
    }

    /// Replaces any stale session with a fresh, registered one.
    async fn begin_session(&self, retry_count: u32) -> (u64, watch::Receiver<bool>) {
        let stale = lock(&self.state).session.as_ref().map(|s| s.id);
        if let Some(stale_id) = stale {
            debug!(session_id = stale_id, "Closing stale session");
            self.close_session(stale_id).await;
        }

        let (completion_tx, completion_rx) = watch::channel(false);
        let mut state = lock(&self.state);
        state.next_session_id += 1;
        state.sessions_started += 1;
        let session_id = state.next_session_id;

        self.transport.register_listener(Arc::clone(&self.listener));
        state.session = Some(Session {
            id: session_id,
            retry_count,
            registered: true,
            channel: None,
            reader_active: false,
            completion_tx,
            cancel_tx: watch::channel(false).0,
        });

        debug!(session_id, retry_count, "Sync session started");
        (session_id, completion_rx)
    }

    /// Unregisters and closes session `session_id` if it is still current.
    pub(crate) async fn close_session(&self, session_id: u64) {
        let channel = {
            let mut state = lock(&self.state);
            if state.session.as_ref().map(|s| s.id) != Some(session_id) {
                return;
            }
            let session = match state.session.take() {
                Some(session) => session,
                None => return,
            };
            if session.registered {
                self.transport.unregister_listener(&self.listener);
            }
            session.cancel_tx.send_replace(true);
            session.channel
        };

        if let Some(channel) = channel {
            if let Err(e) = self.transport.close(channel.id).await {
                warn!(session_id, channel = %channel.id, error = %e, "Failed to close sync channel");
            }
        }
        debug!(session_id, "Sync session closed");
    }

    /// Forwards a sync request downstream if this role chains.
    async fn propagate(&self) {
        if !self.settings.role.chains_propagation() {
            return;
        }

        match self.commands.send_command(Command::RequestDbSync).await {
            Ok(reached) => {
                info!(reached, "Forwarded sync request to peers");
                self.emitter.emit(&SyncEvent::Propagated { reached });
            }
            Err(e) => warn!(error = %e, "Failed to forward sync request"),
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for creating a SyncCoordinator.
pub struct SyncCoordinatorBuilder {
    settings: CoordinatorSettings,
    transport: Option<Arc<dyn ChannelTransport>>,
    commands: Option<Arc<dyn CommandSender>>,
    store: Option<Arc<dyn RecordStore>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl SyncCoordinatorBuilder {
    pub fn new(settings: CoordinatorSettings) -> Self {
        SyncCoordinatorBuilder {
            settings,
            transport: None,
            commands: None,
            store: None,
            emitter: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn ChannelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_commands(mut self, commands: Arc<dyn CommandSender>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Builds the coordinator.
    pub fn build(self) -> SyncResult<SyncCoordinator> {
        if self.settings.device_id.is_empty() {
            return Err(SyncError::MissingDeviceId);
        }
        let transport = self
            .transport
            .ok_or_else(|| SyncError::InvalidConfig("transport is required".into()))?;
        let commands = self
            .commands
            .ok_or_else(|| SyncError::InvalidConfig("command sender is required".into()))?;
        let store = self
            .store
            .ok_or_else(|| SyncError::InvalidConfig("record store is required".into()))?;
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        Ok(SyncCoordinator::with_emitter(
            self.settings,
            transport,
            commands,
            store,
            emitter,
        ))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNetwork, MemoryTransport};
    use crate::store::MemoryRecordStore;
    use gluco_core::{decode_records, encode_records, GlucoseRecord};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::Instant;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    /// Forwards every event into a channel the test can read.
    struct ChannelEmitter(mpsc::UnboundedSender<SyncEvent>);

    impl SyncEventEmitter for ChannelEmitter {
        fn emit(&self, event: &SyncEvent) {
            let _ = self.0.send(event.clone());
        }
    }

    struct Node {
        coordinator: SyncCoordinator,
        transport: MemoryTransport,
        store: Arc<MemoryRecordStore>,
        events: UnboundedReceiver<SyncEvent>,
        commands: Option<mpsc::Receiver<CommandEnvelope>>,
    }

    async fn node(
        network: &Arc<MemoryNetwork>,
        id: &str,
        role: DeviceRole,
        store: MemoryRecordStore,
    ) -> Node {
        let (transport, commands_rx) = network.create_transport(id).await;
        let store = Arc::new(store);
        let (tx, events) = mpsc::unbounded_channel();

        let coordinator = SyncCoordinatorBuilder::new(CoordinatorSettings::new(id, role))
            .with_transport(Arc::new(transport.clone()))
            .with_commands(Arc::new(transport.clone()))
            .with_store(store.clone())
            .with_emitter(Arc::new(ChannelEmitter(tx)))
            .build()
            .unwrap();

        Node {
            coordinator,
            transport,
            store,
            events,
            commands: Some(commands_rx),
        }
    }

    fn recent_records(count: i64) -> Vec<GlucoseRecord> {
        let now = now_ms();
        (0..count)
            .map(|n| GlucoseRecord::new(now - (n + 1) * 5 * 60_000, 110 + n as i32))
            .collect()
    }

    async fn next_matching(
        events: &mut UnboundedReceiver<SyncEvent>,
        pred: impl Fn(&SyncEvent) -> bool,
    ) -> SyncEvent {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    }

    async fn wait_until_idle(coordinator: &SyncCoordinator) {
        while coordinator.is_syncing() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn drain(events: &mut UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_wait_policy_defaults() {
        let wait = WaitPolicy::default();
        assert_eq!(wait.max_wait(), Duration::from_secs(10));
        assert_eq!(wait.max_retries, 3);
        assert_eq!(wait.retry_backoff, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_builder_requires_collaborators() {
        let err = SyncCoordinatorBuilder::new(CoordinatorSettings::new("phone", DeviceRole::Phone))
            .build()
            .err()
            .unwrap();
        assert!(err.is_config_error());

        let err = SyncCoordinatorBuilder::new(CoordinatorSettings::new("", DeviceRole::Phone))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::MissingDeviceId));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_peer_answers_retries_then_gives_up() {
        let network = MemoryNetwork::new();
        let mut phone = node(&network, "phone", DeviceRole::Phone, MemoryRecordStore::new()).await;
        let (_watch, mut watch_rx) = network.create_transport("watch").await;

        let start = Instant::now();
        assert!(phone.coordinator.request_sync());
        wait_until_idle(&phone.coordinator).await;
        let elapsed = start.elapsed();

        // 4 waits of 10s and 3 backoffs of 10s
        assert!(elapsed >= Duration::from_secs(70), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(72), "{:?}", elapsed);

        let events = drain(&mut phone.events);
        let count = |f: fn(&SyncEvent) -> bool| events.iter().filter(|e| f(e)).count();
        assert_eq!(count(|e| matches!(e, SyncEvent::SessionStarted { .. })), 4);
        assert_eq!(count(|e| matches!(e, SyncEvent::TimedOut { .. })), 4);
        assert_eq!(count(|e| matches!(e, SyncEvent::RetryScheduled { .. })), 3);
        assert_eq!(count(|e| matches!(e, SyncEvent::Succeeded { .. })), 0);
        assert!(events.contains(&SyncEvent::GaveUp { retry_count: 3 }));
        assert_eq!(events.last(), Some(&SyncEvent::Propagated { reached: 1 }));

        let retries: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                SyncEvent::SessionStarted { retry_count, .. } => Some(*retry_count),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![0, 1, 2, 3]);

        let mut received = Vec::new();
        while let Ok(envelope) = watch_rx.try_recv() {
            received.push(envelope.command);
        }
        assert_eq!(
            received,
            vec![
                Command::DbSync,
                Command::DbSync,
                Command::DbSync,
                Command::DbSync,
                Command::RequestDbSync
            ]
        );

        let status = phone.coordinator.status();
        assert!(!status.active);
        assert_eq!(status.session_id, None);
        assert_eq!(status.last_outcome, Some(SyncOutcome::GaveUp));
        assert_eq!(status.sessions_started, 4);
        assert_eq!(phone.transport.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_sends_five_records() {
        let network = MemoryNetwork::new();
        let mut car = node(&network, "car", DeviceRole::Other, MemoryRecordStore::new()).await;
        let mut watch = node(
            &network,
            "watch",
            DeviceRole::Wearable,
            MemoryRecordStore::with_records(recent_records(5)),
        )
        .await;
        watch.coordinator.serve_commands(watch.commands.take().unwrap());

        let start = Instant::now();
        assert!(car.coordinator.request_sync());
        wait_until_idle(&car.coordinator).await;
        assert!(start.elapsed() < Duration::from_secs(2));

        let events = drain(&mut car.events);
        assert!(events.contains(&SyncEvent::Succeeded {
            session_id: 1,
            retry_count: 0
        }));
        assert!(!events.iter().any(|e| matches!(e, SyncEvent::RetryScheduled { .. })));
        assert!(!events.iter().any(|e| matches!(e, SyncEvent::Propagated { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::ImportCompleted { report, .. } if report.inserted == 5
        )));

        assert_eq!(car.store.len().await, 5);
        let status = car.coordinator.status();
        assert_eq!(status.last_outcome, Some(SyncOutcome::Succeeded));
        assert!(status.last_success_ms.is_some());
        assert_eq!(car.transport.listener_count(), 0);

        let sent = next_matching(&mut watch.events, |e| matches!(e, SyncEvent::DataSent { .. })).await;
        assert!(matches!(sent, SyncEvent::DataSent { ref peer, .. } if peer == "car"));
    }

    #[tokio::test]
    async fn test_wearable_prunes_after_send() {
        let network = MemoryNetwork::new();
        let now = now_ms();
        let mut records = recent_records(3);
        records.push(GlucoseRecord::new(now - 30 * HOUR_MS, 140));
        records.push(GlucoseRecord::new(now - 48 * HOUR_MS, 150));

        let watch = node(
            &network,
            "watch",
            DeviceRole::Wearable,
            MemoryRecordStore::with_records(records),
        )
        .await;
        let (phone, _phone_rx) = network.create_transport("phone").await;
        let (tx, mut opened) = mpsc::unbounded_channel();
        phone.register_listener(Arc::new(OpenRecorder(tx)));

        let report = watch.coordinator.push_to("phone").await.unwrap();
        assert_eq!(report.pruned, 2);
        assert_eq!(watch.store.len().await, 3);

        let handle = opened.recv().await.unwrap();
        let payload = read_all(&phone, handle.id).await;
        assert_eq!(decode_records(&payload).unwrap().len(), 5);
        assert_eq!(report.bytes, payload.len());
    }

    #[tokio::test]
    async fn test_phone_exports_satellite_window_only() {
        let network = MemoryNetwork::new();
        let now = now_ms();
        let mut records = recent_records(3);
        records.push(GlucoseRecord::new(now - 30 * HOUR_MS, 140));

        let phone = node(
            &network,
            "phone",
            DeviceRole::Phone,
            MemoryRecordStore::with_records(records),
        )
        .await;
        let (watch, _watch_rx) = network.create_transport("watch").await;
        let (tx, mut opened) = mpsc::unbounded_channel();
        watch.register_listener(Arc::new(OpenRecorder(tx)));

        let report = phone.coordinator.push_to("watch").await.unwrap();
        assert_eq!(report.pruned, 0);
        assert_eq!(phone.store.len().await, 4);

        let handle = opened.recv().await.unwrap();
        let payload = read_all(&watch, handle.id).await;
        assert_eq!(decode_records(&payload).unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_requests_are_ignored() {
        let network = MemoryNetwork::new();
        let phone = node(&network, "phone", DeviceRole::Phone, MemoryRecordStore::new()).await;

        assert!(phone.coordinator.request_sync());
        assert!(!phone.coordinator.request_sync());
        assert!(!phone.coordinator.request_sync_with_retry(2));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!phone.coordinator.request_sync());

        let status = phone.coordinator.status();
        assert!(status.active);
        assert!(status.registered);
        assert_eq!(status.sessions_started, 1);
        assert_eq!(phone.transport.listener_count(), 1);

        phone.coordinator.shutdown().await.unwrap();
        assert_eq!(phone.transport.listener_count(), 0);
        assert_eq!(
            phone.coordinator.status().last_outcome,
            Some(SyncOutcome::Cancelled)
        );
        assert!(phone.coordinator.request_sync());
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbled_payload_is_retried() {
        let network = MemoryNetwork::new();
        let mut phone = node(&network, "phone", DeviceRole::Other, MemoryRecordStore::new()).await;
        let (watch, mut watch_rx) = network.create_transport("watch").await;

        let start = Instant::now();
        assert!(phone.coordinator.request_sync());

        let payloads = [
            b"[{\"timestamp\": 1700000000000, \"val".to_vec(),
            encode_records(&recent_records(2)).unwrap().into_bytes(),
        ];
        for payload in payloads {
            let envelope = watch_rx.recv().await.unwrap();
            assert_eq!(envelope.command, Command::DbSync);
            let handle = watch.open(&envelope.from, DB_SYNC_CHANNEL_PATH).await.unwrap();
            let mut writer = watch.output_stream(handle.id).await.unwrap();
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
            watch.close(handle.id).await.unwrap();
        }

        wait_until_idle(&phone.coordinator).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(22), "{:?}", elapsed);

        let events = drain(&mut phone.events);
        assert!(events.iter().any(|e| matches!(e, SyncEvent::ImportFailed { session_id: 1, .. })));
        assert!(events.contains(&SyncEvent::Succeeded {
            session_id: 2,
            retry_count: 1
        }));
        assert_eq!(phone.store.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_path_is_ignored() {
        let network = MemoryNetwork::new();
        let mut phone = node(&network, "phone", DeviceRole::Other, MemoryRecordStore::new()).await;
        let (watch, mut watch_rx) = network.create_transport("watch").await;

        assert!(phone.coordinator.request_sync());
        watch_rx.recv().await.unwrap();

        let handle = watch.open("phone", "/settings").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = phone.coordinator.status();
        assert_eq!(status.channel, None);
        assert!(status.registered);
        assert!(drain(&mut phone.events)
            .iter()
            .all(|e| matches!(e, SyncEvent::SessionStarted { .. })));
        // Untouched: still waiting for its reader.
        assert_eq!(phone.transport.open_channels(), 1);

        watch.close(handle.id).await.unwrap();
        phone.coordinator.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_surplus_channel_is_rejected() {
        let network = MemoryNetwork::new();
        let mut phone = node(&network, "phone", DeviceRole::Other, MemoryRecordStore::new()).await;
        let (watch, mut watch_rx) = network.create_transport("watch").await;

        assert!(phone.coordinator.request_sync());
        watch_rx.recv().await.unwrap();

        let first = watch.open("phone", DB_SYNC_CHANNEL_PATH).await.unwrap();
        let second = watch.open("phone", DB_SYNC_CHANNEL_PATH).await.unwrap();

        let rejected = next_matching(&mut phone.events, |e| {
            matches!(e, SyncEvent::ChannelRejected { .. })
        })
        .await;
        assert_eq!(
            rejected,
            SyncEvent::ChannelRejected {
                channel: second.id,
                peer: "watch".into()
            }
        );
        assert_eq!(phone.coordinator.status().channel, Some(first.id));

        phone.coordinator.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_phone_success_propagates_to_wearable() {
        let network = MemoryNetwork::new();
        let mut phone = node(&network, "phone", DeviceRole::Phone, MemoryRecordStore::new()).await;
        let mut watch = node(
            &network,
            "watch",
            DeviceRole::Wearable,
            MemoryRecordStore::with_records(recent_records(4)),
        )
        .await;
        phone.coordinator.serve_commands(phone.commands.take().unwrap());
        watch.coordinator.serve_commands(watch.commands.take().unwrap());

        assert!(phone.coordinator.request_sync());

        next_matching(&mut phone.events, |e| matches!(e, SyncEvent::Propagated { reached: 1 })).await;
        assert_eq!(phone.store.len().await, 4);

        // The watch runs its own request and receives the phone's window.
        let succeeded =
            next_matching(&mut watch.events, |e| matches!(e, SyncEvent::Succeeded { .. })).await;
        assert!(matches!(succeeded, SyncEvent::Succeeded { retry_count: 0, .. }));
        wait_until_idle(&watch.coordinator).await;
        assert!(!watch
            .events
            .try_recv()
            .map(|e| matches!(e, SyncEvent::Propagated { .. }))
            .unwrap_or(false));
        assert_eq!(watch.store.len().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_stops_when_session_closes() {
        let network = MemoryNetwork::new();
        let mut phone = node(&network, "phone", DeviceRole::Other, MemoryRecordStore::new()).await;
        let (watch, mut watch_rx) = network.create_transport("watch").await;

        assert!(phone.coordinator.request_sync());
        watch_rx.recv().await.unwrap();

        // Opened but never written to or closed.
        let handle = watch.open("phone", DB_SYNC_CHANNEL_PATH).await.unwrap();
        let mut writer = watch.output_stream(handle.id).await.unwrap();

        wait_until_idle(&phone.coordinator).await;
        assert_eq!(phone.coordinator.status().last_outcome, Some(SyncOutcome::GaveUp));
        assert_eq!(phone.transport.open_channels(), 0);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        let payload = encode_records(&recent_records(1)).unwrap();
        assert!(writer.write_all(payload.as_bytes()).await.is_err());
        drop(writer);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = drain(&mut phone.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::ChannelAccepted { session_id: 1, .. })));
        assert!(!events.iter().any(|e| matches!(
            e,
            SyncEvent::ImportCompleted { .. } | SyncEvent::ImportFailed { .. }
        )));
        assert_eq!(phone.store.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_closed_before_import_finishes() {
        let network = MemoryNetwork::new();
        let (transport, _commands_rx) = network.create_transport("phone").await;
        let store = Arc::new(SlowStore {
            records: MemoryRecordStore::new(),
            delay: Duration::from_secs(3),
        });
        let (tx, mut events) = mpsc::unbounded_channel();
        let coordinator =
            SyncCoordinatorBuilder::new(CoordinatorSettings::new("phone", DeviceRole::Other))
                .with_transport(Arc::new(transport.clone()))
                .with_commands(Arc::new(transport.clone()))
                .with_store(store.clone())
                .with_emitter(Arc::new(ChannelEmitter(tx)))
                .build()
                .unwrap();
        let (watch, mut watch_rx) = network.create_transport("watch").await;

        assert!(coordinator.request_sync());
        watch_rx.recv().await.unwrap();
        let payload = encode_records(&recent_records(3)).unwrap();
        let channel = send_payload(&watch, "phone", payload.as_bytes()).await;
        watch.close(channel).await.unwrap();

        // Input closed, import still running.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = coordinator.status();
        assert!(status.active);
        assert_eq!(status.session_id, Some(1));
        assert!(!status.registered);
        assert_eq!(status.channel, None);
        assert_eq!(store.records.len().await, 0);

        wait_until_idle(&coordinator).await;
        let status = coordinator.status();
        assert_eq!(status.last_outcome, Some(SyncOutcome::Succeeded));
        assert_eq!(status.sessions_started, 1);
        assert_eq!(store.records.len().await, 3);
        assert_eq!(transport.open_channels(), 0);
        assert_eq!(transport.listener_count(), 0);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, SyncEvent::ImportCompleted { session_id: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_closed_after_import_finishes() {
        let network = MemoryNetwork::new();
        let mut phone = node(&network, "phone", DeviceRole::Other, MemoryRecordStore::new()).await;
        let (watch, mut watch_rx) = network.create_transport("watch").await;

        assert!(phone.coordinator.request_sync());
        watch_rx.recv().await.unwrap();
        let garbled = send_payload(&watch, "phone", b"[{\"timestamp\": 17").await;
        next_matching(&mut phone.events, |e| {
            matches!(e, SyncEvent::ImportFailed { session_id: 1, .. })
        })
        .await;

        // The reader is done; the session still holds the channel.
        let status = phone.coordinator.status();
        assert_eq!(status.channel, Some(garbled));
        assert!(status.registered);
        assert_eq!(phone.transport.open_channels(), 1);

        watch.close(garbled).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = phone.coordinator.status();
        assert_eq!(status.session_id, Some(1));
        assert_eq!(status.channel, None);
        assert!(!status.registered);
        assert_eq!(phone.transport.open_channels(), 0);

        // The attempt still times out and the retry recovers.
        watch_rx.recv().await.unwrap();
        let payload = encode_records(&recent_records(2)).unwrap();
        let good = send_payload(&watch, "phone", payload.as_bytes()).await;
        watch.close(good).await.unwrap();

        wait_until_idle(&phone.coordinator).await;
        assert_eq!(
            phone.coordinator.status().last_outcome,
            Some(SyncOutcome::Succeeded)
        );
        assert_eq!(phone.store.len().await, 2);
        assert_eq!(phone.transport.open_channels(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_leaves_no_session_behind() {
        let network = MemoryNetwork::new();
        let phone = node(&network, "phone", DeviceRole::Other, MemoryRecordStore::new()).await;

        for _ in 0..50 {
            assert!(phone.coordinator.request_sync());
            tokio::task::yield_now().await;
            phone.coordinator.shutdown().await.unwrap();

            let status = phone.coordinator.status();
            assert!(!status.active);
            assert_eq!(status.session_id, None);
            assert!(!status.registered);
            assert_eq!(phone.transport.listener_count(), 0);
        }
    }

    /// Memory store whose imports take `delay`.
    struct SlowStore {
        records: MemoryRecordStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl RecordStore for SlowStore {
        async fn import_json(&self, json: &str) -> SyncResult<ImportReport> {
            tokio::time::sleep(self.delay).await;
            self.records.import_json(json).await
        }

        async fn export_json_since(&self, min_timestamp_ms: i64) -> SyncResult<String> {
            self.records.export_json_since(min_timestamp_ms).await
        }

        async fn delete_older_than(&self, timestamp_ms: i64) -> SyncResult<u64> {
            self.records.delete_older_than(timestamp_ms).await
        }
    }

    /// Opens a sync channel to `to`, writes `payload` and ends the stream.
    async fn send_payload(peer: &MemoryTransport, to: &str, payload: &[u8]) -> ChannelId {
        let handle = peer.open(to, DB_SYNC_CHANNEL_PATH).await.unwrap();
        let mut writer = peer.output_stream(handle.id).await.unwrap();
        writer.write_all(payload).await.unwrap();
        writer.shutdown().await.unwrap();
        handle.id
    }

    struct OpenRecorder(mpsc::UnboundedSender<ChannelHandle>);

    impl ChannelListener for OpenRecorder {
        fn on_channel_event(&self, event: ChannelEvent) {
            if let ChannelEvent::Opened(handle) = event {
                let _ = self.0.send(handle);
            }
        }
    }

    async fn read_all(transport: &MemoryTransport, channel: ChannelId) -> String {
        use tokio::io::AsyncReadExt;
        let mut reader = transport.input_stream(channel).await.unwrap();
        let mut payload = String::new();
        reader.read_to_string(&mut payload).await.unwrap();
        payload
    }
}
