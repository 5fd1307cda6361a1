//! The typed message schema exchanged with the broker.
//!
//! Every frame carries exactly one [`Message`]. The schema is an external,
//! versioned contract: clients in other languages speak the same tagged-map
//! encoding, so variants are matched exhaustively and an unknown tag is a
//! fatal decode error rather than something to skip over.
//!
//! Argument and return payloads (`data` fields) are opaque at this layer;
//! the facade encodes and decodes them with [`crate::codec`].

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Version of this message schema. Bumped on incompatible changes; the
/// broker refuses clients speaking another version.
pub const PROTOCOL_VERSION: u32 = 1;

/// One protocol message, tagged on the wire with a `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Announce that this client hosts a service.
    Register(Register),
    /// Ask the broker to deliver an event to this client.
    Subscribe(Subscribe),
    /// Invoke a method on a service.
    Request(Request),
    /// Answer to a prior request with the same id.
    Reply(Reply),
    /// Fire-and-forget event.
    Publish(Publish),
}

/// Service registration, sent once per hosted service name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub service: String,
    pub version: u32,
}

impl Register {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            version: PROTOCOL_VERSION,
        }
    }
}

/// Event subscription, sent once per event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    pub event: String,
}

/// A remote method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique among requests pending on this connection.
    pub id: u64,
    pub service: String,
    pub method: String,
    /// Encoded arguments, absent for nullary methods.
    pub data: Option<ByteBuf>,
    /// Milliseconds since the Unix epoch, stamped at send time.
    pub timestamp: u64,
}

impl Request {
    pub fn new(id: u64, service: impl Into<String>, method: impl Into<String>, data: Option<Vec<u8>>) -> Self {
        Self {
            id,
            service: service.into(),
            method: method.into(),
            data: data.map(ByteBuf::from),
            timestamp: unix_millis(),
        }
    }
}

/// Answer to a [`Request`], matched by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub outcome: ReplyOutcome,
}

impl Reply {
    pub fn success(id: u64, data: Option<Vec<u8>>) -> Self {
        Self {
            id,
            outcome: ReplyOutcome::Success {
                data: data.map(ByteBuf::from),
            },
        }
    }

    pub fn error(id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: ReplyOutcome::Error {
                kind,
                message: message.into(),
            },
        }
    }
}

/// Outcome carried in a [`Reply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyOutcome {
    Success { data: Option<ByteBuf> },
    Error { kind: ErrorKind, message: String },
}

/// Error kinds a reply can carry back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The target service has no such method.
    MethodNotFound,
    /// The arguments could not be decoded by the handler.
    BadArguments,
    /// The handler ran and failed.
    Handler,
    /// The broker gave up waiting on the target service.
    Timeout,
}

/// A published event, no correlation id, zero or more receivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publish {
    pub event: String,
    pub data: Option<ByteBuf>,
}

impl Publish {
    pub fn new(event: impl Into<String>, data: Option<Vec<u8>>) -> Self {
        Self {
            event: event.into(),
            data: data.map(ByteBuf::from),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
