//! Client builder and facade.
//!
//! [`ClientBuilder`] configures the connection and collects method and
//! subscription registrations made before connecting; [`Client`] is the
//! public surface over a live connection: `call`, `publish`, `subscribe`,
//! `register_method`, `close`.
//!
//! # Example
//!
//! ```ignore
//! use cellaserv_client::{Client, HandlerError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .register_method("led", "blink", |times: u32| async move {
//!             Ok(format!("blinked {times} times"))
//!         })?
//!         .subscribe("match_start", |_: ()| async {
//!             println!("match started");
//!             Ok(())
//!         })
//!         .connect("127.0.0.1:4200")
//!         .await?;
//!
//!     let date: String = client.call("date", "now", &()).await?;
//!     println!("broker date: {date}");
//!
//!     client.wait_for_shutdown().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec;
use crate::connection::{Connection, ConnectionConfig, ConnectionState};
use crate::error::{ClientError, Result};
use crate::protocol::{Message, Publish, Register, Request, Subscribe, DEFAULT_MAX_FRAME_SIZE};
use crate::registry::{HandlerError, ServiceRegistry};
use crate::tracker::RequestTracker;
use crate::writer::WriterHandle;

/// Default timeout for establishing the broker connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum concurrently running method handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Default writer channel capacity.
pub const DEFAULT_WRITER_CHANNEL_CAPACITY: usize = 256;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
    /// Default deadline for `call`; `call_with_timeout` overrides per call.
    pub call_timeout: Duration,
    /// Frames declaring a larger payload are rejected as `FrameTooLarge`.
    pub max_frame_size: u32,
    /// Bound on concurrently running method handlers.
    pub max_concurrent_handlers: usize,
    /// Capacity of the outgoing frame queue.
    pub writer_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            writer_channel_capacity: DEFAULT_WRITER_CHANNEL_CAPACITY,
        }
    }
}

impl ClientConfig {
    fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: self.connect_timeout,
            max_frame_size: self.max_frame_size,
            max_concurrent_handlers: self.max_concurrent_handlers,
            writer_channel_capacity: self.writer_channel_capacity,
        }
    }
}

/// Builder for configuring and connecting a client.
pub struct ClientBuilder {
    config: ClientConfig,
    registry: Arc<ServiceRegistry>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            registry: Arc::new(ServiceRegistry::new()),
        }
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the default per-call timeout.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set the maximum accepted frame payload size.
    pub fn max_frame_size(mut self, max: u32) -> Self {
        self.config.max_frame_size = max;
        self
    }

    /// Set the bound on concurrently running method handlers.
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the outgoing frame queue capacity.
    pub fn writer_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer_channel_capacity = capacity;
        self
    }

    /// Register a method handler before connecting.
    ///
    /// Fails with [`ClientError::DuplicateMethod`] if the (service, method)
    /// pair is already taken.
    pub fn register_method<F, T, R, Fut>(self, service: &str, method: &str, handler: F) -> Result<Self>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        self.registry.register_method(service, method, handler)?;
        Ok(self)
    }

    /// Subscribe to an event before connecting.
    pub fn subscribe<F, T, Fut>(self, event: &str, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.registry.subscribe(event, handler);
        self
    }

    /// Connect to a broker over TCP and announce registrations.
    pub async fn connect(self, addr: &str) -> Result<Client> {
        let tracker = Arc::new(RequestTracker::new());
        let connection = Connection::connect(
            addr,
            &self.config.connection(),
            self.registry.clone(),
            tracker.clone(),
        )
        .await?;

        Client::start(self.config, self.registry, tracker, connection).await
    }

    /// Connect over an already-established bidirectional stream.
    ///
    /// Useful for transports other than plain TCP and for tests driving the
    /// client with an in-memory stream.
    pub async fn connect_stream<S>(self, stream: S) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let tracker = Arc::new(RequestTracker::new());
        let connection = Connection::from_stream(
            stream,
            &self.config.connection(),
            self.registry.clone(),
            tracker.clone(),
        );

        Client::start(self.config, self.registry, tracker, connection).await
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected cellaserv client.
///
/// A `Client` owns exactly one connection and its request id space. There
/// is no automatic reconnection: when the connection drops, pending and
/// future calls fail with `ConnectionClosed` and the embedding application
/// decides whether to build a new client.
pub struct Client {
    config: ClientConfig,
    registry: Arc<ServiceRegistry>,
    tracker: Arc<RequestTracker>,
    writer: WriterHandle,
    connection: Connection,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Announce pre-connect registrations to the broker and assemble the
    /// facade.
    async fn start(
        config: ClientConfig,
        registry: Arc<ServiceRegistry>,
        tracker: Arc<RequestTracker>,
        connection: Connection,
    ) -> Result<Self> {
        let writer = connection.writer();

        for service in registry.service_names() {
            writer
                .send_message(&Message::Register(Register::new(service)))
                .await?;
        }
        for event in registry.event_names() {
            writer
                .send_message(&Message::Subscribe(Subscribe { event }))
                .await?;
        }

        Ok(Self {
            config,
            registry,
            tracker,
            writer,
            connection,
        })
    }

    /// Invoke a remote method and wait for its reply, with the default
    /// call timeout.
    pub async fn call<A, R>(&self, service: &str, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_with_timeout(service, method, args, self.config.call_timeout)
            .await
    }

    /// Invoke a remote method with an explicit deadline.
    ///
    /// Returns the decoded reply payload, or exactly one of: the remote
    /// error carried in an error reply, [`ClientError::Timeout`] when the
    /// deadline elapses (the waiter is deregistered, so a late reply is
    /// silently discarded), or [`ClientError::ConnectionClosed`].
    pub async fn call_with_timeout<A, R>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let data = codec::encode(args)?;
        let (id, rx) = self.tracker.register();

        let request = Request::new(id, service, method, Some(data));
        if let Err(e) = self.writer.send_message(&Message::Request(request)).await {
            self.tracker.discard(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => match outcome? {
                Some(bytes) => codec::decode(&bytes),
                // Empty reply decodes as nil, for R = () or Option<T>.
                None => codec::decode(&[0xc0]),
            },
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.tracker.discard(id);
                tracing::debug!(%service, %method, id, "call timed out");
                Err(ClientError::Timeout)
            }
        }
    }

    /// Publish an event with a typed payload.
    pub async fn publish<T: Serialize + ?Sized>(&self, event: &str, data: &T) -> Result<()> {
        let payload = codec::encode(data)?;
        self.writer
            .send_message(&Message::Publish(Publish::new(event, Some(payload))))
            .await
    }

    /// Publish an event without a payload.
    pub async fn notify(&self, event: &str) -> Result<()> {
        self.writer
            .send_message(&Message::Publish(Publish::new(event, None)))
            .await
    }

    /// Subscribe to an event on a connected client.
    ///
    /// The broker is asked to deliver the event only for the first local
    /// subscriber; further subscribers fan out locally.
    pub async fn subscribe<F, T, Fut>(&self, event: &str, handler: F) -> Result<()>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let first_for_event = self.registry.subscribe(event, handler);
        if first_for_event {
            self.writer
                .send_message(&Message::Subscribe(Subscribe {
                    event: event.to_string(),
                }))
                .await?;
        }
        Ok(())
    }

    /// Register a method handler on a connected client.
    ///
    /// The broker learns about the service the first time one of its
    /// methods is registered. Duplicate (service, method) pairs are
    /// rejected.
    pub async fn register_method<F, T, R, Fut>(
        &self,
        service: &str,
        method: &str,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        let service_is_new = self.registry.register_method(service, method, handler)?;
        if service_is_new {
            self.writer
                .send_message(&Message::Register(Register::new(service)))
                .await?;
        }
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.tracker.pending_count()
    }

    /// Close the connection, failing any outstanding calls with
    /// `ConnectionClosed`.
    pub async fn close(self) {
        self.connection.close().await;
    }

    /// Wait until the connection tears down.
    pub async fn wait_for_shutdown(self) {
        self.connection.wait_for_shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.call_timeout, DEFAULT_CALL_TIMEOUT);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.max_concurrent_handlers, DEFAULT_MAX_CONCURRENT_HANDLERS);
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .call_timeout(Duration::from_secs(2))
            .max_frame_size(512)
            .max_concurrent_handlers(8)
            .writer_channel_capacity(16);

        assert_eq!(builder.config.connect_timeout, Duration::from_secs(1));
        assert_eq!(builder.config.call_timeout, Duration::from_secs(2));
        assert_eq!(builder.config.max_frame_size, 512);
        assert_eq!(builder.config.max_concurrent_handlers, 8);
        assert_eq!(builder.config.writer_channel_capacity, 16);
    }

    #[test]
    fn test_builder_rejects_duplicate_method() {
        let result = Client::builder()
            .register_method("led", "blink", |_: ()| async { Ok(()) })
            .unwrap()
            .register_method("led", "blink", |_: ()| async { Ok(()) });

        assert!(matches!(result, Err(ClientError::DuplicateMethod { .. })));
    }

    #[test]
    fn test_builder_collects_registrations() {
        let builder = Client::builder()
            .register_method("led", "blink", |_: ()| async { Ok(()) })
            .unwrap()
            .subscribe("match_start", |_: ()| async { Ok(()) });

        assert_eq!(builder.registry.service_names(), vec!["led".to_string()]);
        assert_eq!(
            builder.registry.event_names(),
            vec!["match_start".to_string()]
        );
    }
}
