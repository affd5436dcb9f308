//! Connection handling for PeerNet
//!
//! Manages a single peer link, including:
//! - Transport lifecycle (connect, monitor, disconnect, close, error teardown)
//! - Message assembly from the inbound byte stream
//! - Delivery of each message to everyone waiting for the next one
//! - Automatic keepalive replies

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::assembler::Assembler;
use super::responder::{AutoRespond, KeepaliveResponder};
use super::transport::{
    Dialer, Transport, TransportError, TransportEvent, TransportReader, TransportWriter, WriteAck,
};
use super::waiters::{WaitResult, Waiter, WaiterQueue};
use super::ConnectionConfig;
use crate::protocol::{CodecError, Message, NetworkProfile};

/// Connection errors
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Framing error: {0}")]
    Framing(#[from] CodecError),

    #[error("Invalid message: {command}")]
    InvalidMessage { command: String },

    #[error("Connection closed")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection unusable after a fatal error")]
    Unusable,
}

impl ConnectionError {
    /// Whether this error ends the connection instance
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::Transport(_) | ConnectionError::Framing(_))
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport attached
    Disconnected,
    /// Dialing the transport
    Connecting,
    /// Transport ready, monitoring inbound data
    Connected,
    /// Closing at the caller's request
    Disconnecting,
    /// Tearing down after a fatal error
    Erroring,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages sent, including automatic replies
    pub messages_sent: u64,
    /// Valid messages received
    pub messages_received: u64,
    /// Messages that failed validation
    pub invalid_messages: u64,
    /// Keepalive and other automatic replies
    pub auto_responses: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    failed: bool,
    peer: Option<String>,
    stats: ConnectionStats,
    /// Stops the current session's monitor between transport reads
    stop: Option<Arc<Notify>>,
}

impl Status {
    fn stop_monitor(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.notify_one();
        }
    }
}

/// State shared between the connection handle, its monitor task and any
/// in-flight automatic replies
struct Shared {
    id: Uuid,
    profile: NetworkProfile,
    config: ConnectionConfig,
    status: Mutex<Status>,
    waiters: Mutex<WaiterQueue>,
    writer: tokio::sync::Mutex<Option<Box<dyn TransportWriter>>>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn waiters(&self) -> MutexGuard<'_, WaiterQueue> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unavailable(&self) -> ConnectionError {
        if self.status().failed {
            ConnectionError::Unusable
        } else {
            ConnectionError::NotConnected
        }
    }

    /// Write through the transport. A failed write is fatal.
    async fn write(&self, bytes: Bytes) -> ConnectionResult<WriteAck> {
        let len = bytes.len() as u64;
        let result = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer.write(bytes).await,
                None => return Err(self.unavailable()),
            }
        };

        match result {
            Ok(ack) => {
                let mut status = self.status();
                status.stats.messages_sent += 1;
                status.stats.bytes_sent += len;
                Ok(ack)
            }
            Err(error) => {
                let error = ConnectionError::from(error);
                self.fail(error.clone()).await;
                Err(error)
            }
        }
    }

    /// Handle one completed message: validate, auto-respond, then deliver
    async fn dispatch(self: &Arc<Self>, responder: &Arc<dyn AutoRespond>, message: Message) {
        let valid = message.is_valid().await;

        // A failed send may have torn the connection down meanwhile
        if self.status().failed {
            return;
        }

        if !valid {
            tracing::warn!("Invalid {} message from connection {}", message.command(), self.id);
            self.status().stats.invalid_messages += 1;
            self.waiters().reject_all(&ConnectionError::InvalidMessage {
                command: message.command().to_string(),
            });
            return;
        }

        self.status().stats.messages_received += 1;

        if let Some(reply) = responder.on_message(&message) {
            tracing::debug!("Auto-responding to {} with {}", message.command(), reply.command());
            self.status().stats.auto_responses += 1;

            let shared = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = shared.write(reply.serialize()).await {
                    tracing::warn!("Failed to send {} reply: {}", reply.command(), e);
                }
            });
        }

        let delivered = self.waiters().resolve_all(&message);
        tracing::debug!("Received {} ({} waiters)", message.command(), delivered);
    }

    /// Tear the connection down after a fatal error. Every pending waiter is
    /// rejected and the instance becomes unusable.
    async fn fail(&self, error: ConnectionError) {
        {
            let mut status = self.status();
            if status.failed {
                return;
            }
            status.failed = true;
            status.state = ConnectionState::Erroring;
            status.stop_monitor();
        }

        tracing::error!("Connection {} failed: {}", self.id, error);

        let rejected = self.waiters().reject_all(&error);
        if rejected > 0 {
            tracing::debug!("Rejected {} pending waiters", rejected);
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer.close().await;
        }
        self.status().state = ConnectionState::Disconnected;
    }

    /// The peer closed its side
    async fn on_end(&self) {
        tracing::info!("Connection {} closed by peer", self.id);

        if self.config.reject_waiters_on_end {
            self.waiters().reject_all(&ConnectionError::Closed);
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer.close().await;
        }

        let mut status = self.status();
        status.stop = None;
        if !status.failed {
            status.state = ConnectionState::Disconnected;
        }
    }
}

/// Single task per connection: reads chunks serially and processes each
/// one, including every message in its remainder, before reading the next
async fn monitor(
    shared: Arc<Shared>,
    mut reader: Box<dyn TransportReader>,
    responder: Arc<dyn AutoRespond>,
    stop: Arc<Notify>,
) {
    let mut assembler = Assembler::new(&shared.profile, shared.config.max_message_size);

    loop {
        let event = tokio::select! {
            event = reader.next_event() => event,
            _ = stop.notified() => {
                tracing::debug!("Monitor for connection {} stopped", shared.id);
                return;
            }
        };

        match event {
            Ok(TransportEvent::Data(chunk)) => {
                shared.status().stats.bytes_received += chunk.len() as u64;

                for parsed in assembler.drain(chunk) {
                    if shared.status().failed {
                        return;
                    }
                    match parsed {
                        Ok(message) => shared.dispatch(&responder, message).await,
                        Err(e) => {
                            shared.fail(ConnectionError::Framing(e)).await;
                            return;
                        }
                    }
                }
            }
            Ok(TransportEvent::End) => {
                shared.on_end().await;
                return;
            }
            Err(e) => {
                shared.fail(ConnectionError::Transport(e)).await;
                return;
            }
        }
    }
}

/// Puts a connection left in `Connecting` back to `Disconnected` when an
/// open attempt fails or its future is dropped
struct ConnectingGuard<'a> {
    shared: &'a Shared,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut status = self.shared.status();
        if status.state == ConnectionState::Connecting {
            status.state = ConnectionState::Disconnected;
        }
    }
}

/// Represents a connection to a remote peer
pub struct Connection {
    shared: Arc<Shared>,
    responder: Arc<dyn AutoRespond>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Create an idle connection for the given network
    pub fn new(profile: NetworkProfile, config: ConnectionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                profile,
                config,
                status: Mutex::new(Status {
                    state: ConnectionState::Disconnected,
                    failed: false,
                    peer: None,
                    stats: ConnectionStats::default(),
                    stop: None,
                }),
                waiters: Mutex::new(WaiterQueue::new()),
                writer: tokio::sync::Mutex::new(None),
            }),
            responder: Arc::new(KeepaliveResponder),
            monitor: Mutex::new(None),
        }
    }

    /// Replace the automatic responder. Takes effect on the next connect.
    pub fn with_responder(mut self, responder: impl AutoRespond + 'static) -> Self {
        self.responder = Arc::new(responder);
        self
    }

    /// Unique identifier used in logs
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn profile(&self) -> &NetworkProfile {
        &self.shared.profile
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.status().state
    }

    /// Whether the connection is ready to send
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Remote peer, once a transport has been attached
    pub fn peer(&self) -> Option<String> {
        self.shared.status().peer.clone()
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.shared.status().stats.clone()
    }

    /// Number of callers waiting for the next message
    pub fn pending_waiters(&self) -> usize {
        self.shared.waiters().len()
    }

    fn begin_connect(&self) -> ConnectionResult<ConnectingGuard<'_>> {
        let mut status = self.shared.status();
        if status.failed {
            return Err(ConnectionError::Unusable);
        }
        if status.state != ConnectionState::Disconnected {
            return Err(ConnectionError::AlreadyConnected);
        }
        status.state = ConnectionState::Connecting;
        Ok(ConnectingGuard {
            shared: &*self.shared,
        })
    }

    /// Open a transport and start monitoring it
    ///
    /// Resolves once the transport is ready; fails if dialing fails or
    /// exceeds the configured timeout.
    pub async fn connect(&self, dialer: &dyn Dialer) -> ConnectionResult<()> {
        let _connecting = self.begin_connect()?;
        tracing::info!("Connecting to {}", dialer.peer());

        let dialed = match tokio::time::timeout(self.shared.config.connect_timeout(), dialer.dial()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match dialed {
            Ok(transport) => {
                self.start(transport).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", dialer.peer(), e);
                Err(ConnectionError::Transport(e))
            }
        }
    }

    /// Adopt an already established transport, e.g. an accepted socket
    pub async fn attach(&self, transport: Transport) -> ConnectionResult<()> {
        let _connecting = self.begin_connect()?;
        self.start(transport).await;
        Ok(())
    }

    async fn start(&self, transport: Transport) {
        let Transport { reader, writer, peer } = transport;

        let stop = Arc::new(Notify::new());
        *self.shared.writer.lock().await = Some(writer);
        {
            let mut status = self.shared.status();
            status.state = ConnectionState::Connected;
            status.peer = Some(peer.clone());
            status.stop = Some(Arc::clone(&stop));
        }

        let handle = tokio::spawn(monitor(
            Arc::clone(&self.shared),
            reader,
            Arc::clone(&self.responder),
            stop,
        ));
        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }

        tracing::info!("Connected to {} (connection {})", peer, self.shared.id);
    }

    /// Send a message
    ///
    /// On a stream transport this resolves once the bytes are written and
    /// flushed. On a channel transport it resolves as soon as the frame is
    /// handed off, since the channel gives no write acknowledgment.
    pub async fn send(&self, message: &Message) -> ConnectionResult<()> {
        if !self.is_active() {
            return Err(self.shared.unavailable());
        }

        tracing::debug!("Sending {} ({} bytes)", message.command(), message.serialized_len());
        self.shared.write(message.serialize()).await.map(|_| ())
    }

    /// Wait for the next fully assembled message, whatever its command
    pub fn next_message(&self) -> Waiter {
        self.shared.waiters().register()
    }

    /// Stop waiting without settling the waiter
    pub fn abandon(&self, waiter: &Waiter) -> bool {
        self.shared.waiters().abandon(waiter.id())
    }

    /// Endless stream of every message result settled after this call,
    /// in stream order. Drop it to stop listening.
    pub fn messages(&self) -> Messages {
        Messages {
            rx: self.shared.waiters().subscribe(),
        }
    }

    /// Half-close: shut our outbound side down and keep reading until the
    /// peer ends its side, so a final message in flight still reaches
    /// pending waiters. The connection stays `Disconnecting` until then;
    /// `close` cuts it short.
    pub async fn disconnect(&self) -> ConnectionResult<()> {
        {
            let mut status = self.shared.status();
            if status.state != ConnectionState::Connected {
                return Err(if status.failed {
                    ConnectionError::Unusable
                } else {
                    ConnectionError::NotConnected
                });
            }
            status.state = ConnectionState::Disconnecting;
        }
        tracing::info!("Disconnecting connection {}", self.shared.id);

        let writer = self.shared.writer.lock().await.take();
        match writer {
            Some(mut writer) => writer.disconnect().await.map_err(ConnectionError::from),
            None => Ok(()),
        }
    }

    /// Drop the transport immediately, including after `disconnect`.
    /// Pending waiters are left alone.
    pub async fn close(&self) -> ConnectionResult<()> {
        let writer = self.begin_shutdown().await?;
        tracing::info!("Closing connection {}", self.shared.id);

        if let Some(mut writer) = writer {
            writer.close().await;
        }
        self.finish_shutdown().await;
        Ok(())
    }

    async fn begin_shutdown(&self) -> ConnectionResult<Option<Box<dyn TransportWriter>>> {
        {
            let mut status = self.shared.status();
            if !matches!(
                status.state,
                ConnectionState::Connected | ConnectionState::Disconnecting
            ) {
                return Err(if status.failed {
                    ConnectionError::Unusable
                } else {
                    ConnectionError::NotConnected
                });
            }
            status.state = ConnectionState::Disconnecting;
            status.stop_monitor();
        }

        Ok(self.shared.writer.lock().await.take())
    }

    async fn finish_shutdown(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        let mut status = self.shared.status();
        if !status.failed {
            status.state = ConnectionState::Disconnected;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.status().stop_monitor();
        self.shared.waiters().reject_all(&ConnectionError::Closed);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("network", &self.shared.profile.network)
            .field("state", &self.state())
            .finish()
    }
}

/// Endless stream of messages from one connection
///
/// Never ends on its own; drop it to stop listening. Unread results are
/// buffered. Once the connection is gone every poll yields
/// [`ConnectionError::Closed`].
pub struct Messages {
    rx: mpsc::UnboundedReceiver<WaitResult>,
}

impl Stream for Messages {
    type Item = WaitResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
            .map(|next| Some(next.unwrap_or(Err(ConnectionError::Closed))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::{channel_pair, listen_channels, TcpDialer, TransportResult};
    use crate::protocol::{commands, Feed, MessageParser, VersionPayload};
    use async_trait::async_trait;
    use bytes::BytesMut;
    use futures::StreamExt;
    use std::io;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok, assert_pending, task};

    fn mainnet() -> NetworkProfile {
        NetworkProfile::mainnet()
    }

    fn connection() -> Connection {
        Connection::new(mainnet(), ConnectionConfig::default())
    }

    async fn attached() -> (Connection, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let conn = connection();
        assert_ok!(conn.attach(Transport::stream(local, "duplex")).await);
        (conn, remote)
    }

    /// Read exactly one message from the raw peer side
    async fn read_message(remote: &mut DuplexStream) -> Message {
        let mut parser = MessageParser::new(&mainnet());
        let mut buf = [0u8; 256];
        loop {
            let n = remote.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer side closed");
            if let Feed::Complete { message, .. } =
                parser.feed(Bytes::copy_from_slice(&buf[..n])).unwrap()
            {
                return message;
            }
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    struct SilentReader;

    #[async_trait]
    impl TransportReader for SilentReader {
        async fn next_event(&mut self) -> TransportResult<TransportEvent> {
            std::future::pending().await
        }
    }

    struct BrokenWriter;

    #[async_trait]
    impl TransportWriter for BrokenWriter {
        async fn write(&mut self, _bytes: Bytes) -> TransportResult<WriteAck> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe").into())
        }

        async fn disconnect(&mut self) -> TransportResult<()> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn test_handshake_over_tcp_with_fragmented_verack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut header = [0u8; 24];
            socket.read_exact(&mut header).await.unwrap();
            let len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
            let mut payload = vec![0u8; len as usize];
            socket.read_exact(&mut payload).await.unwrap();
            assert_eq!(&header[4..11], b"version");

            let verack = Message::verack(&mainnet()).serialize();
            for part in [&verack[..5], &verack[5..17], &verack[17..]] {
                socket.write_all(part).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            socket
        });

        let conn = connection();
        assert_ok!(conn.connect(&TcpDialer::new(addr)).await);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.peer(), Some(addr.to_string()));

        let waiter = conn.next_message();
        let version = Message::version(&mainnet(), &VersionPayload::new(70012, 0));
        assert_ok!(conn.send(&version).await);

        let reply = assert_ok!(waiter.await);
        assert_eq!(reply, Message::verack(&mainnet()));
        assert_eq!(conn.stats().messages_received, 1);

        let socket = peer.await.unwrap();
        assert_ok!(conn.disconnect().await);
        assert_eq!(conn.state(), ConnectionState::Disconnecting);

        drop(socket);
        wait_for(|| conn.state() == ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_all_waiters_get_the_same_message() {
        let (conn, mut remote) = attached().await;
        let first = conn.next_message();
        let second = conn.next_message();
        let third = conn.next_message();
        assert_eq!(conn.pending_waiters(), 3);

        let verack = Message::verack(&mainnet());
        remote.write_all(&verack.serialize()).await.unwrap();

        assert_eq!(assert_ok!(first.await), verack);
        assert_eq!(assert_ok!(second.await), verack);
        assert_eq!(assert_ok!(third.await), verack);

        let mut late = task::spawn(conn.next_message());
        assert_pending!(late.poll());
    }

    #[tokio::test]
    async fn test_ping_is_answered_and_delivered() {
        let (conn, mut remote) = attached().await;
        let waiter = conn.next_message();

        let ping = Message::ping(&mainnet(), 0x0102_0304_0506_0708);
        remote.write_all(&ping.serialize()).await.unwrap();

        assert_eq!(assert_ok!(waiter.await), ping);

        let pong = read_message(&mut remote).await;
        assert_eq!(pong.command(), commands::PONG);
        assert_eq!(pong.nonce(), Some(0x0102_0304_0506_0708));
        wait_for(|| conn.stats().auto_responses == 1).await;
    }

    #[tokio::test]
    async fn test_invalid_message_is_scoped() {
        let (conn, mut remote) = attached().await;
        let waiter = conn.next_message();

        let mut corrupt = BytesMut::from(&Message::ping(&mainnet(), 9).serialize()[..]);
        corrupt[20] ^= 0xff;
        remote.write_all(&corrupt).await.unwrap();

        let err = assert_err!(waiter.await);
        assert!(matches!(err, ConnectionError::InvalidMessage { ref command } if command == "ping"));
        assert!(!err.is_fatal());

        // The connection keeps going
        let waiter = conn.next_message();
        let verack = Message::verack(&mainnet());
        remote.write_all(&verack.serialize()).await.unwrap();
        assert_eq!(assert_ok!(waiter.await), verack);
        assert!(conn.is_active());

        let stats = conn.stats();
        assert_eq!(stats.invalid_messages, 1);
        assert_eq!(stats.auto_responses, 0);
    }

    #[tokio::test]
    async fn test_framing_error_is_fatal() {
        let (conn, mut remote) = attached().await;
        let waiter = conn.next_message();

        let foreign = Message::verack(&NetworkProfile::testnet());
        remote.write_all(&foreign.serialize()).await.unwrap();

        let err = assert_err!(waiter.await);
        assert!(matches!(err, ConnectionError::Framing(CodecError::InvalidMagic { .. })));
        assert!(err.is_fatal());

        wait_for(|| conn.state() == ConnectionState::Disconnected).await;
        let err = assert_err!(conn.send(&Message::verack(&mainnet())).await);
        assert!(matches!(err, ConnectionError::Unusable));

        let (rendezvous, _listener) = listen_channels(1);
        let err = assert_err!(conn.connect(&rendezvous.dialer("again")).await);
        assert!(matches!(err, ConnectionError::Unusable));
    }

    #[tokio::test]
    async fn test_multiple_messages_in_one_frame() {
        let (local, remote) = channel_pair();
        let conn = connection();
        assert_ok!(conn.attach(Transport::channel(local, "peer")).await);
        let mut peer = Transport::channel(remote, "us");

        let waiter = conn.next_message();
        let ping = Message::ping(&mainnet(), 1);
        let verack = Message::verack(&mainnet());
        let mut frame = BytesMut::new();
        frame.extend_from_slice(&ping.serialize());
        frame.extend_from_slice(&verack.serialize());
        assert_ok!(peer.writer.write(frame.freeze()).await);

        // The waiter is settled by the first message only
        assert_eq!(assert_ok!(waiter.await), ping);
        wait_for(|| conn.stats().messages_received == 2).await;

        match assert_ok!(peer.reader.next_event().await) {
            TransportEvent::Data(bytes) => {
                assert_eq!(bytes, Message::pong_from_ping(&ping).serialize())
            }
            TransportEvent::End => panic!("unexpected end"),
        }
    }

    #[tokio::test]
    async fn test_messages_stream_yields_in_order() {
        let (conn, mut remote) = attached().await;
        let mut messages = conn.messages();

        remote
            .write_all(&Message::ping(&mainnet(), 1).serialize())
            .await
            .unwrap();
        assert_eq!(messages.next().await.unwrap().unwrap().nonce(), Some(1));

        // Both messages of one chunk reach the stream
        let mut frame = BytesMut::new();
        frame.extend_from_slice(&Message::pong_from_ping(&Message::ping(&mainnet(), 2)).serialize());
        frame.extend_from_slice(&Message::version(&mainnet(), &VersionPayload::new(70012, 0)).serialize());
        remote.write_all(&frame).await.unwrap();

        let first = messages.next().await.unwrap().unwrap();
        let second = messages.next().await.unwrap().unwrap();
        assert_eq!(first.command(), commands::PONG);
        assert_eq!(second.command(), commands::VERSION);
        assert_eq!(conn.pending_waiters(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_still_delivers_final_message() {
        let (conn, mut remote) = attached().await;
        let waiter = conn.next_message();

        assert_ok!(conn.disconnect().await);
        assert_eq!(conn.state(), ConnectionState::Disconnecting);
        let err = assert_err!(conn.send(&Message::verack(&mainnet())).await);
        assert!(matches!(err, ConnectionError::NotConnected));

        // Our outbound side is shut
        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);

        let verack = Message::verack(&mainnet());
        remote.write_all(&verack.serialize()).await.unwrap();
        assert_eq!(assert_ok!(waiter.await), verack);

        drop(remote);
        wait_for(|| conn.state() == ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_close_after_disconnect_keeps_waiters_pending() {
        let (conn, _remote) = attached().await;
        assert_ok!(conn.disconnect().await);
        let mut waiter = task::spawn(conn.next_message());

        assert_ok!(conn.close().await);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_pending!(waiter.poll());
        assert_eq!(conn.pending_waiters(), 1);
        assert!(matches!(
            assert_err!(conn.disconnect().await),
            ConnectionError::NotConnected
        ));
    }

    #[tokio::test]
    async fn test_close_allows_reconnect() {
        let (conn, _first_remote) = attached().await;
        assert_ok!(conn.close().await);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(
            assert_err!(conn.close().await),
            ConnectionError::NotConnected
        ));

        let (local, mut remote) = tokio::io::duplex(1024);
        assert_ok!(conn.attach(Transport::stream(local, "second")).await);
        assert_eq!(conn.peer(), Some("second".to_string()));

        let waiter = conn.next_message();
        let verack = Message::verack(&mainnet());
        remote.write_all(&verack.serialize()).await.unwrap();
        assert_eq!(assert_ok!(waiter.await), verack);
    }

    #[tokio::test]
    async fn test_attach_twice_is_rejected() {
        let (conn, _remote) = attached().await;
        let (local, _other) = tokio::io::duplex(1024);

        let err = assert_err!(conn.attach(Transport::stream(local, "again")).await);
        assert!(matches!(err, ConnectionError::AlreadyConnected));
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn test_end_leaves_waiters_by_default() {
        let (conn, remote) = attached().await;
        let mut waiter = task::spawn(conn.next_message());

        drop(remote);
        wait_for(|| conn.state() == ConnectionState::Disconnected).await;
        assert_pending!(waiter.poll());
    }

    #[tokio::test]
    async fn test_end_rejects_waiters_when_configured() {
        let (local, remote) = tokio::io::duplex(1024);
        let conn = Connection::new(mainnet(), ConnectionConfig::default().rejecting_waiters_on_end());
        assert_ok!(conn.attach(Transport::stream(local, "duplex")).await);
        let waiter = conn.next_message();

        drop(remote);
        assert!(matches!(assert_err!(waiter.await), ConnectionError::Closed));
        wait_for(|| conn.state() == ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_dropping_connection_rejects_waiters() {
        let (conn, _remote) = attached().await;
        let waiter = conn.next_message();
        let mut messages = conn.messages();

        drop(conn);
        assert!(matches!(assert_err!(waiter.await), ConnectionError::Closed));

        let next = messages.next().await.unwrap();
        assert!(matches!(next, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_connect_through_channel_rendezvous() {
        let (rendezvous, mut listener) = listen_channels(4);

        let remote = tokio::spawn(async move {
            let offer = listener.accept().await.unwrap();
            assert_eq!(offer.peer_id(), "peer-7");
            let mut peer = Transport::channel(offer.accept().unwrap(), "dialer");

            peer.writer
                .write(Message::ping(&mainnet(), 77).serialize())
                .await
                .unwrap();

            let mut seen = Vec::new();
            let mut parser = MessageParser::new(&mainnet());
            while seen.len() < 2 {
                match peer.reader.next_event().await.unwrap() {
                    TransportEvent::Data(frame) => {
                        if let Feed::Complete { message, .. } = parser.feed(frame).unwrap() {
                            seen.push(message.command().to_string());
                        }
                    }
                    TransportEvent::End => break,
                }
            }
            seen.sort();
            seen
        });

        let conn = connection();
        let waiter = conn.next_message();
        assert_ok!(conn.connect(&rendezvous.dialer("peer-7")).await);
        assert_eq!(assert_ok!(waiter.await).nonce(), Some(77));

        assert_ok!(conn.send(&Message::verack(&mainnet())).await);
        assert_eq!(remote.await.unwrap(), vec!["pong", "verack"]);
    }

    #[tokio::test]
    async fn test_refused_connect_returns_to_disconnected() {
        let (rendezvous, mut listener) = listen_channels(1);
        tokio::spawn(async move {
            while let Some(offer) = listener.accept().await {
                offer.refuse("busy");
            }
        });

        let conn = connection();
        let err = assert_err!(conn.connect(&rendezvous.dialer("peer")).await);
        assert!(matches!(
            err,
            ConnectionError::Transport(TransportError::Refused(ref reason)) if reason == "busy"
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // Nobody answers the offer
        let (rendezvous, _listener) = listen_channels(1);
        let conn = Connection::new(
            mainnet(),
            ConnectionConfig::default().with_connect_timeout(Duration::from_millis(20)),
        );

        let err = assert_err!(conn.connect(&rendezvous.dialer("slow")).await);
        assert!(matches!(err, ConnectionError::Transport(TransportError::Timeout)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancelled_connect_returns_to_disconnected() {
        // Nobody answers the offer, and the caller gives up first
        let (rendezvous, _listener) = listen_channels(1);
        let conn = connection();

        let dialer = rendezvous.dialer("slow");
        let cancelled = tokio::time::timeout(Duration::from_millis(10), conn.connect(&dialer)).await;
        assert!(cancelled.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let (local, _remote) = tokio::io::duplex(1024);
        assert_ok!(conn.attach(Transport::stream(local, "duplex")).await);
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn test_failed_connection_ignores_later_messages() {
        let conn = connection();
        let transport = Transport {
            reader: Box::new(SilentReader),
            writer: Box::new(BrokenWriter),
            peer: "broken".to_string(),
        };
        assert_ok!(conn.attach(transport).await);
        assert_err!(conn.send(&Message::verack(&mainnet())).await);

        // A message still in the chunk being processed when the send failed
        let mut late = task::spawn(conn.next_message());
        conn.shared
            .dispatch(&conn.responder, Message::ping(&mainnet(), 3))
            .await;

        assert_pending!(late.poll());
        let stats = conn.stats();
        assert_eq!(stats.messages_received, 0);
        assert_eq!(stats.auto_responses, 0);
    }

    #[tokio::test]
    async fn test_write_failure_is_fatal() {
        let conn = connection();
        let transport = Transport {
            reader: Box::new(SilentReader),
            writer: Box::new(BrokenWriter),
            peer: "broken".to_string(),
        };
        assert_ok!(conn.attach(transport).await);
        let waiter = conn.next_message();

        let err = assert_err!(conn.send(&Message::verack(&mainnet())).await);
        assert!(matches!(err, ConnectionError::Transport(TransportError::Io(_))));
        assert!(matches!(
            assert_err!(waiter.await),
            ConnectionError::Transport(TransportError::Io(_))
        ));

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let err = assert_err!(conn.send(&Message::verack(&mainnet())).await);
        assert!(matches!(err, ConnectionError::Unusable));
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_not_counted() {
        let (conn, mut remote) = attached().await;
        let abandoned = conn.next_message();
        let kept = conn.next_message();

        assert!(conn.abandon(&abandoned));
        assert_eq!(conn.pending_waiters(), 1);

        let verack = Message::verack(&mainnet());
        remote.write_all(&verack.serialize()).await.unwrap();
        assert_eq!(assert_ok!(kept.await), verack);
        assert!(matches!(assert_err!(abandoned.await), ConnectionError::Closed));
    }
}
