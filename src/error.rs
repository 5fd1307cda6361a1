//! Error types for cellaserv-client.

use thiserror::Error;

use crate::protocol::ErrorKind;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error on the broker connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not establish a connection to the broker.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Outgoing message could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A frame declared a payload larger than the configured maximum.
    /// Fatal to the connection it occurred on.
    #[error("frame of {length} bytes exceeds maximum {max}")]
    FrameTooLarge { length: u32, max: u32 },

    /// A frame payload was not a valid protocol message. The stream is no
    /// longer parseable, so this is fatal to the connection.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] rmp_serde::decode::Error),

    /// No reply arrived within the call deadline. Local only: the request
    /// may still be executing on the remote side.
    #[error("call timed out")]
    Timeout,

    /// The connection closed while the operation was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// The remote side answered with an error reply.
    #[error("remote error ({kind:?}): {message}")]
    Remote { kind: ErrorKind, message: String },

    /// A handler is already registered for this (service, method) pair.
    #[error("method {service}.{method} is already registered")]
    DuplicateMethod { service: String, method: String },
}

/// Result type alias using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;
