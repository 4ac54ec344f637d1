//! Progress sink: the observer notified of session start, progress and completion.

use uuid::Uuid;

use crate::error::TransferError;

/// Which way the file is moving, from this host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

/// Identifies the session an event belongs to. Two sessions may carry the same file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionTag {
    pub id: Uuid,
    pub direction: Direction,
}

/// Observer for transfer sessions. Called from whichever task drives the
/// connection, so implementations must be thread-safe.
///
/// Per session: at most one `on_start`, then zero or more `on_progress` with
/// non-decreasing fractions in `0.0..=1.0`, then exactly one `on_complete`.
/// `on_complete` may arrive without `on_start` when the session fails before
/// the file is known (bad address, unreadable header); the file name is then
/// whatever was known so far, possibly empty.
pub trait ProgressSink: Send + Sync {
    fn on_start(&self, tag: SessionTag, file_name: &str, file_size: u64);
    fn on_progress(&self, tag: SessionTag, file_name: &str, fraction: f64);
    fn on_complete(&self, tag: SessionTag, file_name: &str, error: Option<&TransferError>);
}

/// Owned form of the sink callbacks, for forwarding over a channel.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started {
        tag: SessionTag,
        file_name: String,
        file_size: u64,
    },
    Progress {
        tag: SessionTag,
        file_name: String,
        fraction: f64,
    },
    Completed {
        tag: SessionTag,
        file_name: String,
        error: Option<TransferError>,
    },
}

impl ProgressEvent {
    pub fn tag(&self) -> SessionTag {
        match self {
            ProgressEvent::Started { tag, .. }
            | ProgressEvent::Progress { tag, .. }
            | ProgressEvent::Completed { tag, .. } => *tag,
        }
    }

    pub fn file_name(&self) -> &str {
        match self {
            ProgressEvent::Started { file_name, .. }
            | ProgressEvent::Progress { file_name, .. }
            | ProgressEvent::Completed { file_name, .. } => file_name,
        }
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_start(&self, _tag: SessionTag, _file_name: &str, _file_size: u64) {}
    fn on_progress(&self, _tag: SessionTag, _file_name: &str, _fraction: f64) {}
    fn on_complete(&self, _tag: SessionTag, _file_name: &str, _error: Option<&TransferError>) {}
}
