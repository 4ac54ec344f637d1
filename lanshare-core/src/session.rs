//! Transfer sessions and the host-driven receive state machine.
//!
//! A [`TransferSession`] owns the reporting side of one connection: it forwards
//! start/progress to the sink and guarantees exactly one completion, even if
//! the driving task is dropped mid-transfer. [`ReceiveMachine`] turns the bytes
//! of an inbound connection into actions without doing any I/O itself; the
//! host reads, feeds, and acts.

use std::io;
use std::sync::Arc;

use uuid::Uuid;

use crate::chunk::{effective_chunk_size, fraction};
use crate::error::{ErrorKind, TransferError};
use crate::progress::{Direction, ProgressSink, SessionTag};
use crate::protocol::{sanitize_file_name, Metadata};
use crate::wire::{self, FrameDecodeError, LEN_SIZE};

/// Where a session is in its lifecycle. Send sessions use
/// `Idle..SendingChunks`, receive sessions `AwaitingHeader..ReceivingPayload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    SendingHeader,
    SendingMetadata,
    SendingChunks,
    AwaitingHeader,
    AwaitingMetadata,
    ReceivingPayload,
    Completed,
    Failed(ErrorKind),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed(_))
    }
}

pub struct TransferSession {
    tag: SessionTag,
    peer: String,
    file_name: String,
    file_size: u64,
    transferred: u64,
    phase: Phase,
    sink: Arc<dyn ProgressSink>,
}

impl TransferSession {
    /// Outbound session, starting at `Idle`. The file name is known up front.
    pub fn outbound(
        peer: impl Into<String>,
        file_name: impl Into<String>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self::new(Direction::Send, Phase::Idle, peer.into(), file_name.into(), sink)
    }

    /// Inbound session for an accepted connection, starting at `AwaitingHeader`.
    pub fn inbound(peer: impl Into<String>, sink: Arc<dyn ProgressSink>) -> Self {
        Self::new(
            Direction::Receive,
            Phase::AwaitingHeader,
            peer.into(),
            String::new(),
            sink,
        )
    }

    fn new(
        direction: Direction,
        phase: Phase,
        peer: String,
        file_name: String,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            tag: SessionTag {
                id: Uuid::new_v4(),
                direction,
            },
            peer,
            file_name,
            file_size: 0,
            transferred: 0,
            phase,
            sink,
        }
    }

    pub fn id(&self) -> Uuid {
        self.tag.id
    }

    pub fn tag(&self) -> SessionTag {
        self.tag
    }

    pub fn direction(&self) -> Direction {
        self.tag.direction
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to a non-terminal phase. Ignored once the session has finished.
    pub fn enter(&mut self, phase: Phase) {
        if !self.phase.is_terminal() && !phase.is_terminal() {
            self.phase = phase;
        }
    }

    /// File is known: record it and emit `on_start`.
    pub fn start(&mut self, file_name: impl Into<String>, file_size: u64) {
        if self.phase.is_terminal() {
            return;
        }
        self.file_name = file_name.into();
        self.file_size = file_size;
        self.sink.on_start(self.tag, &self.file_name, file_size);
    }

    /// Record `n` more payload bytes and emit `on_progress`. Nothing is
    /// emitted for zero-byte files.
    pub fn advance(&mut self, n: u64) {
        if self.phase.is_terminal() || self.file_size == 0 {
            return;
        }
        self.transferred = self.transferred.saturating_add(n).min(self.file_size);
        self.sink.on_progress(
            self.tag,
            &self.file_name,
            fraction(self.transferred, self.file_size),
        );
    }

    /// Terminal transition. Emits `on_complete` the first time only and hands
    /// `result` back so callers can `return session.finish(r)`.
    pub fn finish(&mut self, result: Result<(), TransferError>) -> Result<(), TransferError> {
        if self.phase.is_terminal() {
            return result;
        }
        self.phase = match &result {
            Ok(()) => Phase::Completed,
            Err(e) => Phase::Failed(e.kind()),
        };
        self.sink
            .on_complete(self.tag, &self.file_name, result.as_ref().err());
        result
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        if !self.phase.is_terminal() {
            let _ = self.finish(Err(TransferError::network(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "session aborted",
            ))));
        }
    }
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("id", &self.tag.id)
            .field("direction", &self.tag.direction)
            .field("peer", &self.peer)
            .field("file_name", &self.file_name)
            .field("file_size", &self.file_size)
            .field("transferred", &self.transferred)
            .field("phase", &self.phase)
            .finish()
    }
}

/// What the host should do after feeding bytes to a [`ReceiveMachine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveAction {
    /// Metadata decoded; payload follows.
    Started(Metadata),
    /// Next slice of the payload, in order. The host appends it to its output.
    Payload(Vec<u8>),
    /// Payload bytes arrived; `received` is the running total.
    Progress { received: u64, total: u64 },
    /// All `file_size` bytes arrived; the host's output is complete.
    Complete(Metadata),
}

/// Host-driven receive state machine for one inbound connection. Only the
/// header and metadata are buffered; payload bytes pass straight through.
#[derive(Debug)]
pub struct ReceiveMachine {
    delimiter: char,
    phase: Phase,
    buf: Vec<u8>,
    metadata_len: usize,
    metadata: Option<Metadata>,
    received: u64,
}

impl ReceiveMachine {
    pub fn new(delimiter: char) -> Self {
        Self {
            delimiter,
            phase: Phase::AwaitingHeader,
            buf: Vec::with_capacity(LEN_SIZE),
            metadata_len: 0,
            metadata: None,
            received: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// How many bytes to read next. Never more than what the current phase
    /// still needs, so bytes past the payload are left on the socket.
    /// Zero once the machine has finished.
    pub fn wanted(&self, chunk_size: usize) -> usize {
        match self.phase {
            Phase::AwaitingHeader => LEN_SIZE - self.buf.len(),
            Phase::AwaitingMetadata => self.metadata_len - self.buf.len(),
            Phase::ReceivingPayload => {
                let remaining = self.total().saturating_sub(self.received);
                remaining.min(effective_chunk_size(chunk_size) as u64) as usize
            }
            _ => 0,
        }
    }

    /// Feed bytes read from the connection.
    pub fn on_bytes(&mut self, mut bytes: &[u8]) -> Result<Vec<ReceiveAction>, TransferError> {
        let mut actions = Vec::new();
        while !bytes.is_empty() && !self.phase.is_terminal() {
            let take = self.wanted(usize::MAX).min(bytes.len());
            let (head, rest) = bytes.split_at(take);
            bytes = rest;
            match self.phase {
                Phase::AwaitingHeader => {
                    self.buf.extend_from_slice(head);
                    if self.buf.len() == LEN_SIZE {
                        let len = wire::decode_length(&self.buf).map_err(|e| self.fail(e.into()))?;
                        self.buf.clear();
                        self.metadata_len = len;
                        self.phase = Phase::AwaitingMetadata;
                        if len == 0 {
                            // An empty metadata string cannot hold a delimiter.
                            return Err(self.fail(FrameDecodeError::MissingDelimiter.into()));
                        }
                    }
                }
                Phase::AwaitingMetadata => {
                    self.buf.extend_from_slice(head);
                    if self.buf.len() == self.metadata_len {
                        let meta = self.decode_metadata()?;
                        actions.push(ReceiveAction::Started(meta.clone()));
                        self.buf = Vec::new();
                        let empty = meta.file_size == 0;
                        self.metadata = Some(meta);
                        self.phase = Phase::ReceivingPayload;
                        if empty {
                            actions.push(self.complete());
                        }
                    }
                }
                Phase::ReceivingPayload => {
                    let total = self.total();
                    self.received += head.len() as u64;
                    actions.push(ReceiveAction::Payload(head.to_vec()));
                    actions.push(ReceiveAction::Progress {
                        received: self.received,
                        total,
                    });
                    if self.received == total {
                        actions.push(self.complete());
                    }
                }
                _ => {}
            }
        }
        Ok(actions)
    }

    /// The peer closed its side. Only legal once the machine has completed.
    pub fn on_eof(&mut self) -> Result<(), TransferError> {
        match self.phase {
            Phase::Completed => Ok(()),
            Phase::Failed(_) => Err(TransferError::Unknown),
            Phase::AwaitingHeader | Phase::AwaitingMetadata => {
                Err(self.fail(FrameDecodeError::NeedMore.into()))
            }
            _ => Err(self.fail(TransferError::network(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the whole payload arrived",
            )))),
        }
    }

    fn decode_metadata(&mut self) -> Result<Metadata, TransferError> {
        let mut meta =
            wire::parse_metadata(&self.buf, self.delimiter).map_err(|e| self.fail(e.into()))?;
        let name = match sanitize_file_name(&meta.file_name) {
            Some(n) => n.to_string(),
            None => return Err(self.fail(TransferError::InvalidMetadata("unusable file name"))),
        };
        meta.file_name = name;
        Ok(meta)
    }

    fn total(&self) -> u64 {
        self.metadata.as_ref().map_or(0, |m| m.file_size)
    }

    fn complete(&mut self) -> ReceiveAction {
        self.phase = Phase::Completed;
        ReceiveAction::Complete(self.metadata.clone().unwrap_or_else(|| Metadata::new("", 0)))
    }

    fn fail(&mut self, e: TransferError) -> TransferError {
        self.phase = Phase::Failed(e.kind());
        e
    }
}
