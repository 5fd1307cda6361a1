//! # cellaserv-client
//!
//! Rust client for the cellaserv service bus. A client multiplexes three
//! things over one persistent broker connection:
//!
//! - **Services**: register methods other clients can call
//! - **Remote calls**: invoke methods on other services, synchronously
//!   from the caller's point of view
//! - **Events**: publish and subscribe, fire-and-forget
//!
//! ## Architecture
//!
//! Each message travels in a length-prefixed MessagePack frame. A single
//! read-loop task decodes frames and routes them: replies complete their
//! in-flight call by correlation id; incoming requests and events run their
//! handlers on spawned tasks so the read loop never blocks on application
//! code. A dedicated writer task keeps outgoing frames from interleaving.
//!
//! ## Example
//!
//! ```ignore
//! use cellaserv_client::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .register_method("led", "blink", |times: u32| async move {
//!             Ok(format!("blinked {times} times"))
//!         })?
//!         .connect("127.0.0.1:4200")
//!         .await?;
//!
//!     client.notify("ready").await?;
//!     client.wait_for_shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod tracker;
pub mod writer;

mod client;

pub use client::{Client, ClientBuilder, ClientConfig};
pub use connection::ConnectionState;
pub use error::{ClientError, Result};
pub use protocol::ErrorKind;
pub use registry::HandlerError;
