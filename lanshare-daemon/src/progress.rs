//! Progress sinks for the daemon: tracing output and an event channel.

use lanshare_core::{ProgressEvent, ProgressSink, SessionTag, TransferError};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Logs every session event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_start(&self, tag: SessionTag, file_name: &str, file_size: u64) {
        info!(session = %tag.id, direction = ?tag.direction, "{file_name}: {file_size} bytes");
    }

    fn on_progress(&self, tag: SessionTag, file_name: &str, fraction: f64) {
        tracing::debug!(session = %tag.id, "{file_name}: {:.0}%", fraction * 100.0);
    }

    fn on_complete(&self, tag: SessionTag, file_name: &str, error: Option<&TransferError>) {
        match error {
            None => info!(session = %tag.id, direction = ?tag.direction, "{file_name}: done"),
            Some(e) => warn!(session = %tag.id, direction = ?tag.direction, "{file_name}: {e}"),
        }
    }
}

/// Forwards every event into an unbounded channel. Events sent after the
/// receiver is gone are dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn on_start(&self, tag: SessionTag, file_name: &str, file_size: u64) {
        let _ = self.tx.send(ProgressEvent::Started {
            tag,
            file_name: file_name.to_string(),
            file_size,
        });
    }

    fn on_progress(&self, tag: SessionTag, file_name: &str, fraction: f64) {
        let _ = self.tx.send(ProgressEvent::Progress {
            tag,
            file_name: file_name.to_string(),
            fraction,
        });
    }

    fn on_complete(&self, tag: SessionTag, file_name: &str, error: Option<&TransferError>) {
        let _ = self.tx.send(ProgressEvent::Completed {
            tag,
            file_name: file_name.to_string(),
            error: error.cloned(),
        });
    }
}
