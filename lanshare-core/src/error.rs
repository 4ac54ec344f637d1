//! Transfer error taxonomy. Every error is terminal for the session it occurs in.

use std::io;
use std::sync::Arc;

/// Error reported for a transfer session (send or receive).
///
/// Cloneable so the same value can go to the caller and to a progress sink;
/// I/O causes are shared behind `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("invalid file metadata: {0}")]
    InvalidMetadata(&'static str),
    #[error("failed to read file: {0}")]
    FileRead(#[source] Arc<io::Error>),
    #[error("failed to write file: {0}")]
    FileWrite(#[source] Arc<io::Error>),
    #[error("network error: {0}")]
    Network(#[source] Arc<io::Error>),
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] Arc<io::Error>),
    #[error("server error: {0}")]
    Server(#[source] Arc<io::Error>),
    #[error("invalid IP address: {0:?}")]
    InvalidIpAddress(String),
    #[error("invalid port: {0}")]
    InvalidPort(u32),
    #[error("unknown error")]
    Unknown,
}

/// Fieldless mirror of [`TransferError`] for matching and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidMetadata,
    FileRead,
    FileWrite,
    Network,
    ConnectionFailed,
    Server,
    InvalidIpAddress,
    InvalidPort,
    Unknown,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::InvalidMetadata(_) => ErrorKind::InvalidMetadata,
            TransferError::FileRead(_) => ErrorKind::FileRead,
            TransferError::FileWrite(_) => ErrorKind::FileWrite,
            TransferError::Network(_) => ErrorKind::Network,
            TransferError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            TransferError::Server(_) => ErrorKind::Server,
            TransferError::InvalidIpAddress(_) => ErrorKind::InvalidIpAddress,
            TransferError::InvalidPort(_) => ErrorKind::InvalidPort,
            TransferError::Unknown => ErrorKind::Unknown,
        }
    }

    pub fn file_read(e: io::Error) -> Self {
        TransferError::FileRead(Arc::new(e))
    }

    pub fn file_write(e: io::Error) -> Self {
        TransferError::FileWrite(Arc::new(e))
    }

    pub fn network(e: io::Error) -> Self {
        TransferError::Network(Arc::new(e))
    }

    pub fn connection_failed(e: io::Error) -> Self {
        TransferError::ConnectionFailed(Arc::new(e))
    }

    pub fn server(e: io::Error) -> Self {
        TransferError::Server(Arc::new(e))
    }
}
