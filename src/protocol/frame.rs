//! Length-prefixed framing.
//!
//! Every message travels in one frame: a 4-byte big-endian length word
//! followed by that many bytes of MessagePack payload. [`FrameDecoder`]
//! accumulates partial reads in a `bytes::BytesMut` and extracts complete
//! payloads with a two-state machine:
//! - `WaitingForLength`: need the 4-byte prefix
//! - `WaitingForPayload`: prefix parsed, need N more bytes
//!
//! The declared length is checked against the configured maximum as soon as
//! the prefix is readable, before a single payload byte is buffered.

use bytes::{Bytes, BytesMut};

use crate::error::{ClientError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame payload size (4 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Build a complete frame as a single byte vector.
///
/// # Panics
///
/// Panics if the payload does not fit the 4-byte length prefix. The client
/// write path validates against the configured maximum before framing, so
/// this only trips on misuse of the raw helper.
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    assert!(
        payload.len() <= u32::MAX as usize,
        "payload does not fit the length prefix"
    );
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForLength,
    WaitingForPayload { remaining: u32 },
}

/// Incremental decoder turning a byte stream into frame payloads.
///
/// Push socket reads in with [`FrameDecoder::push`]; complete payloads come
/// out in arrival order. Partial data stays buffered for the next push.
pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
    max_frame_size: u32,
}

impl FrameDecoder {
    /// Create a decoder with the default maximum frame size.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom maximum frame size.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
        }
    }

    /// Push data into the decoder and extract all complete frame payloads.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::FrameTooLarge`] if a length prefix exceeds the
    /// configured maximum. The decoder is unusable afterwards; the caller
    /// must tear down the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut payloads = Vec::new();
        while let Some(payload) = self.try_extract_one()? {
            payloads.push(payload);
        }

        Ok(payloads)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            State::WaitingForLength => {
                if self.buffer.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }

                let length = u32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]);

                if length > self.max_frame_size {
                    return Err(ClientError::FrameTooLarge {
                        length,
                        max: self.max_frame_size,
                    });
                }

                let _ = self.buffer.split_to(LENGTH_PREFIX_SIZE);

                if length == 0 {
                    return Ok(Some(Bytes::new()));
                }

                self.state = State::WaitingForPayload { remaining: length };
                self.try_extract_one()
            }

            State::WaitingForPayload { remaining } => {
                let remaining = remaining as usize;
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(remaining).freeze();
                self.state = State::WaitingForLength;
                Ok(Some(payload))
            }
        }
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
