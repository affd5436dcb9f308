//! Transport adapters
//!
//! Two concrete channels sit behind one contract: a byte stream (TCP, or
//! any tokio `AsyncRead + AsyncWrite`), and a message-oriented channel
//! that already delivers discrete frames. Frames are not messages: a frame
//! may hold part of a message or several of them, so both kinds feed the
//! same assembler.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// Read buffer reservation per stream read
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Transport errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    #[error("Connection timeout")]
    Timeout,

    #[error("Channel refused: {0}")]
    Refused(String),

    #[error("Transport closed")]
    Closed,
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::Io(Arc::new(error))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Inbound transport events
#[derive(Debug)]
pub enum TransportEvent {
    Data(Bytes),
    End,
}

/// How a completed write was acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAck {
    /// Written and flushed to the socket
    Flushed,
    /// Handed to the channel; no backpressure signal exists past this point
    HandedOff,
}

#[async_trait]
pub trait TransportReader: Send {
    /// Wait for the next chunk, or the end of the inbound side
    async fn next_event(&mut self) -> TransportResult<TransportEvent>;
}

#[async_trait]
pub trait TransportWriter: Send {
    async fn write(&mut self, bytes: Bytes) -> TransportResult<WriteAck>;

    /// Graceful shutdown of the outbound side
    async fn disconnect(&mut self) -> TransportResult<()>;

    /// Best-effort teardown
    async fn close(&mut self);
}

/// An established duplex transport
pub struct Transport {
    pub reader: Box<dyn TransportReader>,
    pub writer: Box<dyn TransportWriter>,
    pub peer: String,
}

impl Transport {
    /// Wrap a byte stream
    pub fn stream<S>(io: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            reader: Box::new(StreamReader {
                inner: read_half,
                buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            }),
            writer: Box::new(StreamWriter {
                inner: Some(write_half),
            }),
            peer: peer.into(),
        }
    }

    /// Wrap one end of a message-oriented channel
    pub fn channel(end: ChannelEnd, peer: impl Into<String>) -> Self {
        Self {
            reader: Box::new(ChannelReader { rx: end.rx }),
            writer: Box::new(ChannelWriter { tx: Some(end.tx) }),
            peer: peer.into(),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("peer", &self.peer).finish_non_exhaustive()
    }
}

/// Opens transports
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Resolves once the transport is ready to carry data
    async fn dial(&self) -> TransportResult<Transport>;

    /// Human-readable peer description for logs
    fn peer(&self) -> String;
}

/// Plain TCP connect
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: SocketAddr,
}

impl TcpDialer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> TransportResult<Transport> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Transport::stream(stream, self.addr.to_string()))
    }

    fn peer(&self) -> String {
        self.addr.to_string()
    }
}

struct StreamReader<S> {
    inner: ReadHalf<S>,
    buf: BytesMut,
}

#[async_trait]
impl<S: AsyncRead + Send> TransportReader for StreamReader<S> {
    async fn next_event(&mut self) -> TransportResult<TransportEvent> {
        self.buf.reserve(READ_CHUNK_SIZE);
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Ok(TransportEvent::End);
        }
        Ok(TransportEvent::Data(self.buf.split().freeze()))
    }
}

struct StreamWriter<S> {
    inner: Option<WriteHalf<S>>,
}

#[async_trait]
impl<S: AsyncWrite + Send> TransportWriter for StreamWriter<S> {
    async fn write(&mut self, bytes: Bytes) -> TransportResult<WriteAck> {
        let inner = self.inner.as_mut().ok_or(TransportError::Closed)?;
        inner.write_all(&bytes).await?;
        inner.flush().await?;
        Ok(WriteAck::Flushed)
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        if let Some(mut inner) = self.inner.take() {
            inner.shutdown().await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            let _ = inner.shutdown().await;
        }
    }
}

/// One end of an in-process message-oriented channel
#[derive(Debug)]
pub struct ChannelEnd {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Create two connected channel ends
pub fn channel_pair() -> (ChannelEnd, ChannelEnd) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        ChannelEnd { tx: a_tx, rx: a_rx },
        ChannelEnd { tx: b_tx, rx: b_rx },
    )
}

struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl TransportReader for ChannelReader {
    async fn next_event(&mut self) -> TransportResult<TransportEvent> {
        Ok(match self.rx.recv().await {
            Some(frame) => TransportEvent::Data(frame),
            None => TransportEvent::End,
        })
    }
}

struct ChannelWriter {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait]
impl TransportWriter for ChannelWriter {
    async fn write(&mut self, bytes: Bytes) -> TransportResult<WriteAck> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(bytes).map_err(|_| TransportError::Closed)?;
        Ok(WriteAck::HandedOff)
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        self.tx = None;
        Ok(())
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

/// A request to open a channel, as seen by the listening side
#[derive(Debug)]
pub struct ChannelOffer {
    peer_id: String,
    respond: oneshot::Sender<Result<ChannelEnd, String>>,
}

impl ChannelOffer {
    /// Identifier the dialer asked for
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Open the channel. Returns the listener's end, or `None` if the
    /// dialer gave up waiting.
    pub fn accept(self) -> Option<ChannelEnd> {
        let (local, remote) = channel_pair();
        self.respond.send(Ok(remote)).ok().map(|_| local)
    }

    pub fn refuse(self, reason: impl Into<String>) {
        let _ = self.respond.send(Err(reason.into()));
    }
}

/// Listening side of the channel rendezvous
#[derive(Debug)]
pub struct ChannelListener {
    rx: mpsc::Receiver<ChannelOffer>,
}

impl ChannelListener {
    /// Next incoming offer; `None` once every rendezvous handle is gone
    pub async fn accept(&mut self) -> Option<ChannelOffer> {
        self.rx.recv().await
    }
}

/// Dialing side of the channel rendezvous
#[derive(Debug, Clone)]
pub struct ChannelRendezvous {
    tx: mpsc::Sender<ChannelOffer>,
}

impl ChannelRendezvous {
    pub fn dialer(&self, peer_id: impl Into<String>) -> ChannelDialer {
        ChannelDialer {
            tx: self.tx.clone(),
            peer_id: peer_id.into(),
        }
    }
}

/// Create a rendezvous that brokers channel-open handshakes
pub fn listen_channels(backlog: usize) -> (ChannelRendezvous, ChannelListener) {
    let (tx, rx) = mpsc::channel(backlog.max(1));
    (ChannelRendezvous { tx }, ChannelListener { rx })
}

/// Opens a message-oriented channel through a rendezvous
#[derive(Debug, Clone)]
pub struct ChannelDialer {
    tx: mpsc::Sender<ChannelOffer>,
    peer_id: String,
}

#[async_trait]
impl Dialer for ChannelDialer {
    async fn dial(&self) -> TransportResult<Transport> {
        let (respond, response) = oneshot::channel();
        let offer = ChannelOffer {
            peer_id: self.peer_id.clone(),
            respond,
        };

        self.tx
            .send(offer)
            .await
            .map_err(|_| TransportError::Refused("rendezvous closed".to_string()))?;

        match response.await {
            Ok(Ok(end)) => Ok(Transport::channel(end, self.peer_id.clone())),
            Ok(Err(reason)) => Err(TransportError::Refused(reason)),
            Err(_) => Err(TransportError::Refused("offer dropped".to_string())),
        }
    }

    fn peer(&self) -> String {
        self.peer_id.clone()
    }
}
