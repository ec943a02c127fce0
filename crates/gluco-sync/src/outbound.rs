//! # Outbound Send Path
//!
//! The responder side: open a channel to the requester, write the export,
//! close. A satellite prunes its local store after a successful send.
//!
//! Nothing here retries. A failed send just leaves the requester waiting
//! until its own bounded wait restarts the handshake.

use std::sync::Arc;

use gluco_core::now_ms;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Inner, SyncEvent};
use crate::error::SyncResult;
use crate::transport::{ChannelHandle, ChannelId};

/// Result of one push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub peer: String,
    pub channel: ChannelId,
    /// Payload size written.
    pub bytes: usize,
    /// Local records deleted afterwards.
    pub pruned: u64,
}

impl Inner {
    pub(crate) fn send_data(self: &Arc<Self>, peer: String) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match inner.push_to(&peer).await {
                Ok(report) => {
                    info!(
                        peer = %report.peer,
                        channel = %report.channel,
                        bytes = report.bytes,
                        pruned = report.pruned,
                        "Sent records to peer"
                    );
                    inner.emitter.emit(&SyncEvent::DataSent {
                        peer: report.peer,
                        bytes: report.bytes,
                        pruned: report.pruned,
                    });
                }
                Err(e) => {
                    error!(peer = %peer, error = %e, "Failed to send records");
                    inner.emitter.emit(&SyncEvent::SendFailed {
                        peer,
                        error: e.to_string(),
                    });
                }
            }
        })
    }

    pub(crate) async fn push_to(&self, peer: &str) -> SyncResult<SendReport> {
        let handle = self.transport.open(peer, &self.settings.channel_path).await?;
        debug!(channel = %handle.id, peer = %peer, "Opened channel for send");

        let written = self.write_export(&handle).await;
        if let Err(e) = self.transport.close(handle.id).await {
            warn!(channel = %handle.id, error = %e, "Failed to close send channel");
        }
        let bytes = written?;

        let pruned = if self.settings.role.prunes_after_send() {
            let cutoff = self.settings.retention.prune_cutoff(now_ms());
            let deleted = self.store.delete_older_than(cutoff).await?;
            debug!(cutoff, deleted, "Pruned local records after send");
            deleted
        } else {
            0
        };

        Ok(SendReport {
            peer: peer.to_string(),
            channel: handle.id,
            bytes,
            pruned,
        })
    }

    async fn write_export(&self, handle: &ChannelHandle) -> SyncResult<usize> {
        let cutoff = self
            .settings
            .role
            .export_cutoff(now_ms(), &self.settings.retention);
        let payload = self.store.export_json_since(cutoff).await?;

        let mut writer = self.transport.output_stream(handle.id).await?;
        writer.write_all(payload.as_bytes()).await?;
        writer.flush().await?;
        writer.shutdown().await?;

        Ok(payload.len())
    }
}
