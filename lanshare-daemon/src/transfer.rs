//! Transfer engine: TCP listener (incoming files) and outbound sends.
//!
//! One task per connection. Within a connection every read and write is
//! awaited before the next one starts, so at most one chunk is in flight.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lanshare_core::session::Phase;
use lanshare_core::wire::{self, LEN_SIZE};
use lanshare_core::{
    chunk, chunk_ranges, encode_header, EncodedHeader, Metadata, ProgressSink, ReceiveAction,
    ReceiveMachine, TransferError, TransferSession, DEFAULT_CHUNK_SIZE, DEFAULT_DELIMITER,
};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Back-off after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub delimiter: char,
    pub receive_dir: PathBuf,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            delimiter: DEFAULT_DELIMITER,
            receive_dir: PathBuf::from("received"),
        }
    }
}

impl From<&Config> for TransferSettings {
    fn from(c: &Config) -> Self {
        Self {
            chunk_size: c.chunk_size(),
            delimiter: c.delimiter,
            receive_dir: c.receive_dir.clone(),
        }
    }
}

/// Sends files and accepts incoming ones, reporting every session to the sink.
#[derive(Clone)]
pub struct TransferEngine {
    settings: Arc<TransferSettings>,
    sink: Arc<dyn ProgressSink>,
}

impl TransferEngine {
    pub fn new(settings: TransferSettings, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            settings: Arc::new(settings),
            sink,
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Bind `addr` and spawn the accept loop. A bind failure is a `Server` error
    /// and is the caller's to surface.
    pub async fn listen(&self, addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>), TransferError> {
        let listener = TcpListener::bind(addr).await.map_err(TransferError::server)?;
        let local = listener.local_addr().map_err(TransferError::server)?;
        info!("listening for transfers on {local}");
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.accept_loop(listener).await });
        Ok((local, handle))
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("connection from {peer}");
                    let engine = self.clone();
                    tokio::spawn(async move { engine.receive(stream, peer).await });
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Send one file to `ip:port`. The sink sees exactly one completion for the
    /// call, and the same outcome is returned.
    pub async fn send_file(&self, ip: &str, port: u32, path: &Path) -> Result<(), TransferError> {
        let mut session =
            TransferSession::outbound(format!("{ip}:{port}"), send_name(path), self.sink.clone());
        let result = self.drive_send(&mut session, ip, port, path).await;
        match &result {
            Ok(()) => info!(
                session = %session.id(),
                "sent {} ({} bytes) to {}",
                session.file_name(),
                session.file_size(),
                session.peer()
            ),
            Err(e) => warn!(
                session = %session.id(),
                "sending {} to {} failed: {e}",
                session.file_name(),
                session.peer()
            ),
        }
        session.finish(result)
    }

    /// Report a send of `path` to `target` that fails before any socket is
    /// opened, with the same single completion a real attempt would produce.
    pub fn reject_send(
        &self,
        target: &str,
        path: &Path,
        error: TransferError,
    ) -> Result<(), TransferError> {
        let mut session = TransferSession::outbound(target, send_name(path), self.sink.clone());
        warn!(
            session = %session.id(),
            "not sending {} to {target}: {error}",
            session.file_name()
        );
        session.finish(Err(error))
    }

    async fn drive_send(
        &self,
        session: &mut TransferSession,
        ip: &str,
        port: u32,
        path: &Path,
    ) -> Result<(), TransferError> {
        let addr = validate_target(ip, port)?;
        wire::check_file_name(session.file_name(), self.settings.delimiter)?;

        session.enter(Phase::Connecting);
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(TransferError::connection_failed)?;

        let (file, file_size) = open_for_send(path).await?;
        let file_name = session.file_name().to_string();
        let header = encode_header(&Metadata::new(file_name.clone(), file_size), self.settings.delimiter)?;
        session.start(file_name, file_size);

        send_stream(session, &header, file, file_size, &mut stream, self.settings.chunk_size).await
    }

    async fn receive(self, stream: TcpStream, peer: SocketAddr) {
        let mut session = TransferSession::inbound(peer.to_string(), self.sink.clone());
        let result = receive_stream(&mut session, stream, &self.settings).await;
        match &result {
            Ok(()) => info!(
                session = %session.id(),
                "received {} ({} bytes) from {peer}",
                session.file_name(),
                session.file_size()
            ),
            Err(e) => warn!(session = %session.id(), "receive from {peer} failed: {e}"),
        }
        let _ = session.finish(result);
    }
}

/// Name announced for `path`: its last component.
fn send_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Parse and range-check a destination before any socket is opened.
pub fn validate_target(ip: &str, port: u32) -> Result<SocketAddr, TransferError> {
    let ip: IpAddr = ip
        .trim()
        .parse()
        .map_err(|_| TransferError::InvalidIpAddress(ip.to_string()))?;
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(TransferError::InvalidPort(port))?;
    Ok(SocketAddr::new(ip, port))
}

async fn open_for_send(path: &Path) -> Result<(File, u64), TransferError> {
    let file = File::open(path).await.map_err(TransferError::file_read)?;
    let meta = file.metadata().await.map_err(TransferError::file_read)?;
    if !meta.is_file() {
        return Err(TransferError::file_read(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        )));
    }
    Ok((file, meta.len()))
}

async fn write_flushed<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> Result<(), TransferError> {
    w.write_all(bytes).await.map_err(TransferError::network)?;
    w.flush().await.map_err(TransferError::network)
}

/// Header write, metadata write, then the payload chunks, each flushed before
/// the next; finally close the write side.
async fn send_stream<R, W>(
    session: &mut TransferSession,
    header: &EncodedHeader,
    file: R,
    file_size: u64,
    out: &mut W,
    chunk_size: usize,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    session.enter(Phase::SendingHeader);
    write_flushed(out, &header.length).await?;
    session.enter(Phase::SendingMetadata);
    write_flushed(out, &header.metadata).await?;

    session.enter(Phase::SendingChunks);
    send_chunks(session, file, file_size, out, chunk_size).await?;

    out.shutdown().await.map_err(TransferError::network)
}

/// Stream `file_size` bytes of `file` in chunks. Each chunk is written and
/// flushed before the next is read.
async fn send_chunks<R, W>(
    session: &mut TransferSession,
    mut file: R,
    file_size: u64,
    out: &mut W,
    chunk_size: usize,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk::effective_chunk_size(chunk_size)];
    for range in chunk_ranges(file_size, chunk_size) {
        let piece = &mut buf[..range.len()];
        // A file that shrank after the stat ends here with UnexpectedEof.
        file.read_exact(piece).await.map_err(TransferError::file_read)?;
        write_flushed(out, piece).await?;
        session.advance(range.len() as u64);
    }
    Ok(())
}

/// Drive one inbound connection through the receive machine. The payload is
/// written to a hidden part file in the receive directory and renamed into
/// place once complete; on failure the part file is removed.
async fn receive_stream<S>(
    session: &mut TransferSession,
    stream: S,
    settings: &TransferSettings,
) -> Result<(), TransferError>
where
    S: AsyncRead + Unpin,
{
    let mut part = None;
    let result = receive_into(session, stream, settings, &mut part).await;
    if let (Err(_), Some(p)) = (&result, part) {
        p.discard().await;
    }
    result
}

async fn receive_into<S>(
    session: &mut TransferSession,
    mut stream: S,
    settings: &TransferSettings,
    part: &mut Option<PartFile>,
) -> Result<(), TransferError>
where
    S: AsyncRead + Unpin,
{
    let mut machine = ReceiveMachine::new(settings.delimiter);
    let mut buf = vec![0u8; chunk::effective_chunk_size(settings.chunk_size).max(LEN_SIZE)];
    loop {
        let want = machine.wanted(settings.chunk_size).min(buf.len());
        let n = stream
            .read(&mut buf[..want])
            .await
            .map_err(TransferError::network)?;
        if n == 0 {
            return machine.on_eof();
        }
        for action in machine.on_bytes(&buf[..n])? {
            match action {
                ReceiveAction::Started(meta) => {
                    session.enter(Phase::ReceivingPayload);
                    session.start(meta.file_name.clone(), meta.file_size);
                    *part = Some(
                        PartFile::create(&settings.receive_dir, &meta.file_name, session.id())
                            .await?,
                    );
                }
                ReceiveAction::Payload(bytes) => {
                    if let Some(p) = part.as_mut() {
                        p.write(&bytes).await?;
                    }
                }
                ReceiveAction::Progress { received, .. } => {
                    session.advance(received.saturating_sub(session.transferred()));
                }
                ReceiveAction::Complete(_) => {
                    if let Some(p) = part.take() {
                        let path = p.commit().await?;
                        debug!("wrote {}", path.display());
                    }
                    return Ok(());
                }
            }
        }
        session.enter(machine.phase());
    }
}

/// Incoming payload on disk, under a hidden name until it is complete.
struct PartFile {
    file: File,
    part: PathBuf,
    dest: PathBuf,
}

impl PartFile {
    async fn create(dir: &Path, file_name: &str, tag: impl std::fmt::Display) -> Result<Self, TransferError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(TransferError::file_write)?;
        let part = dir.join(format!(".{file_name}.{tag}.part"));
        let file = File::create(&part).await.map_err(TransferError::file_write)?;
        Ok(Self {
            file,
            part,
            dest: dir.join(file_name),
        })
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        self.file
            .write_all(bytes)
            .await
            .map_err(TransferError::file_write)
    }

    /// Flush and move into place, replacing any file of the same name.
    async fn commit(mut self) -> Result<PathBuf, TransferError> {
        let flushed = match self.file.flush().await {
            Ok(()) => self.file.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = flushed {
            self.discard().await;
            return Err(TransferError::file_write(e));
        }
        if let Err(e) = tokio::fs::rename(&self.part, &self.dest).await {
            self.discard().await;
            return Err(TransferError::file_write(e));
        }
        Ok(self.dest)
    }

    async fn discard(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.part).await {
            debug!("could not remove {}: {e}", self.part.display());
        }
    }
}
