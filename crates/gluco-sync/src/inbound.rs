//! # Inbound Receive Path
//!
//! Channel callbacks for the requester side: accept the peer's channel,
//! drain it on a background task, import, signal completion.
//!
//! ## Accept Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Opened(handle) on the sync path                                        │
//! │     │                                                                   │
//! │     ├── live session, registered, no channel yet ──► ACCEPT            │
//! │     │      record channel, reader_active = true, spawn receive          │
//! │     │                                                                   │
//! │     └── anything else ──► REJECT (close the channel)                    │
//! │                                                                         │
//! │  receive: read to EOF ─► UTF-8 ─► store.import_json                     │
//! │     ok  ──► completion flag (only if still the same session)            │
//! │     err ──► log, no flag: the waiter times out and retries              │
//! │     session closed first ──► stop reading, drop the payload             │
//! │     close the channel unless the session still holds it                 │
//! │                                                                         │
//! │  InputClosed for the session's channel: forget the channel and stop     │
//! │  listening. Close it now if the reader is done, otherwise the reader    │
//! │  closes it. InputClosed and the import may finish in either order.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use gluco_db::ImportReport;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::coordinator::{Inner, SyncEvent};
use crate::error::{SyncError, SyncResult};
use crate::transport::{lock, ChannelHandle, ChannelId};

impl Inner {
    pub(crate) fn on_channel_opened(self: &Arc<Self>, handle: ChannelHandle) {
        let accepted = {
            let mut state = lock(&self.state);
            match state.session.as_mut() {
                Some(session) if session.registered && session.channel.is_none() => {
                    session.channel = Some(handle.clone());
                    session.reader_active = true;
                    Some((session.id, session.cancel_tx.subscribe()))
                }
                _ => None,
            }
        };

        match accepted {
            Some((session_id, cancel_rx)) => {
                info!(session_id, channel = %handle.id, peer = %handle.peer, "Accepted sync channel");
                self.emitter.emit(&SyncEvent::ChannelAccepted {
                    session_id,
                    channel: handle.id,
                    peer: handle.peer.clone(),
                });

                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    inner.receive(session_id, handle, cancel_rx).await;
                });
            }
            None => {
                debug!(channel = %handle.id, peer = %handle.peer, "No session waiting, rejecting channel");
                self.emitter.emit(&SyncEvent::ChannelRejected {
                    channel: handle.id,
                    peer: handle.peer.clone(),
                });

                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = inner.transport.close(handle.id).await {
                        warn!(channel = %handle.id, error = %e, "Failed to close rejected channel");
                    }
                });
            }
        }
    }

    async fn receive(
        self: Arc<Self>,
        session_id: u64,
        handle: ChannelHandle,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let result = tokio::select! {
            result = self.read_and_import(&handle) => result,
            _ = async {
                let _ = cancel_rx.wait_for(|cancelled| *cancelled).await;
            } => {
                debug!(session_id, channel = %handle.id, "Session closed before its channel was drained");
                self.close_channel(handle.id).await;
                return;
            }
        };

        let (signalled, session_holds_channel) = {
            let mut state = lock(&self.state);
            match state.session.as_mut() {
                Some(session) if session.id == session_id => {
                    session.reader_active = false;
                    if result.is_ok() {
                        session.completion_tx.send_replace(true);
                    }
                    let holds = session.channel.as_ref().map(|c| c.id) == Some(handle.id);
                    (result.is_ok(), holds)
                }
                _ => (false, false),
            }
        };

        match result {
            Ok(report) => {
                if signalled {
                    debug!(session_id, "Sync completion signalled");
                } else {
                    debug!(session_id, "Import finished after its session ended");
                }
                self.emitter
                    .emit(&SyncEvent::ImportCompleted { session_id, report });
            }
            Err(e) => {
                error!(session_id, channel = %handle.id, error = %e, "Failed to import sync payload");
                self.emitter.emit(&SyncEvent::ImportFailed {
                    session_id,
                    error: e.to_string(),
                });
            }
        }

        // A channel still held by the session is closed by InputClosed or by
        // the session closing.
        if !session_holds_channel {
            self.close_channel(handle.id).await;
        }
    }

    async fn close_channel(&self, channel: ChannelId) {
        if let Err(e) = self.transport.close(channel).await {
            warn!(channel = %channel, error = %e, "Failed to close sync channel");
        }
    }

    async fn read_and_import(&self, handle: &ChannelHandle) -> SyncResult<ImportReport> {
        let mut reader = self.transport.input_stream(handle.id).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;

        if buf.is_empty() {
            return Err(SyncError::InvalidPayload("empty stream".into()));
        }
        let payload =
            String::from_utf8(buf).map_err(|e| SyncError::InvalidPayload(e.to_string()))?;

        let report = self.store.import_json(&payload).await?;
        info!(
            peer = %handle.peer,
            bytes = payload.len(),
            received = report.received,
            inserted = report.inserted,
            rejected = report.rejected,
            "Imported records from peer"
        );
        Ok(report)
    }

    pub(crate) fn on_input_closed(self: &Arc<Self>, handle: ChannelHandle, close_reason: i32, app_code: i32) {
        let close_now = {
            let mut state = lock(&self.state);
            match state.session.as_mut() {
                Some(session) if session.channel.as_ref().map(|c| c.id) == Some(handle.id) => {
                    session.channel = None;
                    if session.registered {
                        session.registered = false;
                        self.transport.unregister_listener(&self.listener);
                    }
                    debug!(session_id = session.id, channel = %handle.id, close_reason, app_code, "Peer finished sending");
                    Some(!session.reader_active)
                }
                _ => None,
            }
        };

        match close_now {
            Some(true) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    inner.close_channel(handle.id).await;
                });
            }
            Some(false) => {}
            None => trace!(channel = %handle.id, "Input closed on a channel outside the session"),
        }
    }

    pub(crate) fn on_output_closed(&self, handle: ChannelHandle, close_reason: i32, app_code: i32) {
        debug!(channel = %handle.id, peer = %handle.peer, close_reason, app_code, "Output closed");
    }
}
