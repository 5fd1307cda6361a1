//! Connection lifecycle: owns the stream, the read loop and the writer.
//!
//! One connection means one read-loop task, one writer task and one request
//! id space. The read loop decodes frames in arrival order and hands each
//! message to the dispatcher without awaiting application code. Any I/O
//! failure, EOF or fatal decode error moves the connection through Closing
//! (failing every pending call with `ConnectionClosed`) to Disconnected.
//! Reconnecting means building a fresh connection; no state carries over.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::codec;
use crate::dispatcher::Dispatcher;
use crate::error::{ClientError, Result};
use crate::protocol::{FrameDecoder, Message};
use crate::registry::ServiceRegistry;
use crate::tracker::RequestTracker;
use crate::writer::{spawn_writer_task, WriterHandle};

/// Read buffer size for the read loop.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Lifecycle states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Tunables for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub max_frame_size: u32,
    pub max_concurrent_handlers: usize,
    pub writer_channel_capacity: usize,
}

/// A live connection to the broker.
pub struct Connection {
    writer: WriterHandle,
    state: Arc<StateCell>,
    close_tx: Option<oneshot::Sender<()>>,
    shutdown_rx: oneshot::Receiver<()>,
}

impl Connection {
    /// Connect to a broker address over TCP.
    pub async fn connect(
        addr: &str,
        config: &ConnectionConfig,
        registry: Arc<ServiceRegistry>,
        tracker: Arc<RequestTracker>,
    ) -> Result<Self> {
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ClientError::Connect {
                    addr: addr.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        stream.set_nodelay(true)?;

        tracing::debug!(%addr, "connected to broker");
        Ok(Self::from_stream(stream, config, registry, tracker))
    }

    /// Build a connection over an already-established bidirectional stream.
    ///
    /// This is what `connect` uses under the hood and what tests use with
    /// in-memory duplex streams.
    pub fn from_stream<S>(
        stream: S,
        config: &ConnectionConfig,
        registry: Arc<ServiceRegistry>,
        tracker: Arc<RequestTracker>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let state = Arc::new(StateCell::new(ConnectionState::Connecting));
        let (reader, write_half) = tokio::io::split(stream);
        let (writer, writer_task) =
            spawn_writer_task(write_half, config.writer_channel_capacity, config.max_frame_size);

        let dispatcher = Dispatcher::new(
            registry,
            tracker.clone(),
            writer.clone(),
            config.max_concurrent_handlers,
        );

        let (close_tx, close_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        state.set(ConnectionState::Connected);
        let loop_state = state.clone();
        let max_frame_size = config.max_frame_size;

        tokio::spawn(async move {
            tokio::select! {
                result = read_loop(reader, dispatcher, max_frame_size) => {
                    match result {
                        Ok(()) => tracing::debug!("broker closed the connection"),
                        Err(e) => tracing::error!("read loop terminated: {e}"),
                    }
                }
                // A failed write is as fatal as a failed read: queued frames
                // are lost, so waiting out call deadlines would be lying.
                result = writer_task => {
                    match result {
                        Ok(Ok(())) => tracing::debug!("writer task finished"),
                        Ok(Err(e)) => tracing::error!("writer task terminated: {e}"),
                        Err(e) => tracing::error!("writer task panicked: {e}"),
                    }
                }
                _ = close_rx => {
                    tracing::debug!("local close requested");
                }
            }

            // Teardown: fail pending calls exactly once, then go quiet.
            loop_state.set(ConnectionState::Closing);
            tracker.fail_all();
            loop_state.set(ConnectionState::Disconnected);
            let _ = shutdown_tx.send(());
        });

        Self {
            writer,
            state,
            close_tx: Some(close_tx),
            shutdown_rx,
        }
    }

    /// Handle for queueing outgoing frames.
    pub fn writer(&self) -> WriterHandle {
        self.writer.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Request teardown and wait for it to finish.
    pub async fn close(mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        let _ = self.shutdown_rx.await;
    }

    /// Wait until the connection tears down (broker close, I/O failure or
    /// fatal decode error).
    pub async fn wait_for_shutdown(self) {
        let _ = self.shutdown_rx.await;
    }
}

/// Decode frames and route messages until EOF or a fatal error.
async fn read_loop<R>(mut reader: R, dispatcher: Dispatcher, max_frame_size: u32) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        for payload in decoder.push(&buf[..n])? {
            let message: Message = codec::decode(&payload)?;
            dispatcher.dispatch(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{duplex, AsyncWriteExt, ReadBuf};

    use crate::protocol::{build_frame, Publish};

    /// Stream whose writes fail immediately while the read side stays open.
    struct BrokenWriteStream;

    impl AsyncRead for BrokenWriteStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenWriteStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write side gone",
            )))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(1),
            max_frame_size: 1024,
            max_concurrent_handlers: 8,
            writer_channel_capacity: 16,
        }
    }

    fn new_connection() -> (Connection, tokio::io::DuplexStream, Arc<RequestTracker>) {
        let (client, server) = duplex(16 * 1024);
        let registry = Arc::new(ServiceRegistry::new());
        let tracker = Arc::new(RequestTracker::new());
        let conn = Connection::from_stream(client, &test_config(), registry, tracker.clone());
        (conn, server, tracker)
    }

    #[tokio::test]
    async fn test_starts_connected_and_disconnects_on_eof() {
        let (conn, server, _tracker) = new_connection();
        assert_eq!(conn.state(), ConnectionState::Connected);

        drop(server);
        let state = conn.state.clone();
        conn.wait_for_shutdown().await;
        assert_eq!(state.get(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_eof_fails_pending_calls() {
        let (conn, server, tracker) = new_connection();
        let (_, rx1) = tracker.register();
        let (_, rx2) = tracker.register();

        drop(server);
        conn.wait_for_shutdown().await;

        for rx in [rx1, rx2] {
            assert!(matches!(
                rx.await.unwrap(),
                Err(ClientError::ConnectionClosed)
            ));
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_is_fatal() {
        let (conn, mut server, tracker) = new_connection();
        let (_, rx) = tracker.register();

        server
            .write_all(&build_frame(b"\x99definitely not a message"))
            .await
            .unwrap();

        conn.wait_for_shutdown().await;
        assert!(matches!(
            rx.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (conn, mut server, tracker) = new_connection();
        let (_, rx) = tracker.register();

        // Declared length far past the configured 1 KiB maximum.
        server.write_all(&(1u32 << 20).to_be_bytes()).await.unwrap();

        conn.wait_for_shutdown().await;
        assert!(matches!(
            rx.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_failure_is_fatal() {
        let registry = Arc::new(ServiceRegistry::new());
        let tracker = Arc::new(RequestTracker::new());
        let conn =
            Connection::from_stream(BrokenWriteStream, &test_config(), registry, tracker.clone());
        let (_, rx) = tracker.register();

        conn.writer()
            .send_message(&Message::Publish(Publish::new("tick", None)))
            .await
            .unwrap();

        let state = conn.state.clone();
        conn.wait_for_shutdown().await;
        assert_eq!(state.get(), ConnectionState::Disconnected);
        assert!(matches!(
            rx.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_requests_teardown() {
        let (conn, _server, tracker) = new_connection();
        let (_, rx) = tracker.register();

        conn.close().await;
        assert!(matches!(
            rx.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_valid_messages_are_dispatched_in_order() {
        // A publish with no subscribers must be routed (and ignored)
        // without killing the loop.
        let (conn, mut server, _tracker) = new_connection();

        let payload = codec::encode(&Message::Publish(Publish::new("tick", None))).unwrap();
        server.write_all(&build_frame(&payload)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(conn.state(), ConnectionState::Connected);
    }
}
