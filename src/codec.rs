//! MessagePack codec using `rmp-serde`.
//!
//! Always uses `to_vec_named` so structs are serialized as maps with field
//! names rather than positional arrays. Field names on the wire are what let
//! the broker and clients written against other runtimes evolve the schema
//! without renumbering anything.
//!
//! # Example
//!
//! ```
//! use cellaserv_client::codec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Position {
//!     x: f64,
//!     y: f64,
//! }
//!
//! let pos = Position { x: 1.0, y: -2.5 };
//! let encoded = codec::encode(&pos).unwrap();
//! let decoded: Position = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded, pos);
//! ```

use crate::error::{ClientError, Result};

/// Encode a value to MessagePack bytes (struct-as-map format).
#[inline]
pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Decode MessagePack bytes into a value.
#[inline]
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(ClientError::MalformedPayload)
}
