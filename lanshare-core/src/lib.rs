//! LanShare protocol: metadata framing, chunking, transfer sessions, peer registry.
//! Host-driven: no I/O; the host reads and writes sockets and files, feeds
//! bytes and discovery events in, and acts on what comes back.

pub mod chunk;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod wire;

pub use chunk::{chunk_ranges, ChunkRange, DEFAULT_CHUNK_SIZE};
pub use error::{ErrorKind, TransferError};
pub use progress::{Direction, NullSink, ProgressEvent, ProgressSink, SessionTag};
pub use protocol::{Metadata, DEFAULT_DELIMITER, DEFAULT_PORT, SERVICE_TYPE};
pub use registry::{FoundOutcome, PeerRecord, Registry};
pub use session::{Phase, ReceiveAction, ReceiveMachine, TransferSession};
pub use wire::{decode_header, encode_header, EncodedHeader, FrameDecodeError, FrameEncodeError};
