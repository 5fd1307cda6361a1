//! Dedicated writer task owning the write half of the connection.
//!
//! Every sender (the facade's calls, handler replies, publishes) pushes
//! complete frames into an mpsc channel; a single task drains the channel
//! and writes them out. Frames therefore never interleave mid-frame, and
//! the bounded channel is the backpressure surface: senders wait when the
//! broker is slow to drain us.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec;
use crate::error::{ClientError, Result};
use crate::protocol::{Message, LENGTH_PREFIX_SIZE};

/// Default writer channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Frames drained per wakeup before flushing.
const MAX_BATCH_SIZE: usize = 32;

/// A frame ready to be written: length prefix plus encoded message.
#[derive(Debug)]
pub struct OutboundFrame {
    prefix: [u8; LENGTH_PREFIX_SIZE],
    payload: Bytes,
}

impl OutboundFrame {
    /// Build a frame from an already-encoded message payload.
    ///
    /// The payload length is validated against `max_frame_size` before the
    /// prefix is built, so a frame the peer's decoder would reject as
    /// `FrameTooLarge` is never queued in the first place.
    pub fn new(payload: Vec<u8>, max_frame_size: u32) -> Result<Self> {
        if payload.len() > max_frame_size as usize {
            return Err(ClientError::FrameTooLarge {
                length: u32::try_from(payload.len()).unwrap_or(u32::MAX),
                max: max_frame_size,
            });
        }
        Ok(Self {
            prefix: (payload.len() as u32).to_be_bytes(),
            payload: Bytes::from(payload),
        })
    }

    /// Encode a protocol message into a frame.
    pub fn encode(message: &Message, max_frame_size: u32) -> Result<Self> {
        Self::new(codec::encode(message)?, max_frame_size)
    }

    /// Total size on the wire.
    pub fn size(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.payload.len()
    }
}

/// Cheaply cloneable handle for queueing frames to the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    max_frame_size: u32,
}

impl WriterHandle {
    /// Queue a frame, waiting if the channel is full.
    ///
    /// Fails with `ConnectionClosed` once the writer task has exited.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Encode a message and queue it.
    ///
    /// Fails with `FrameTooLarge` if the encoded message exceeds the
    /// configured maximum frame size.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        self.send(OutboundFrame::encode(message, self.max_frame_size)?)
            .await
    }
}

/// Spawn the writer task for the given write half.
///
/// The task exits cleanly when every handle is dropped, or with an error on
/// the first failed write.
pub fn spawn_writer_task<W>(
    writer: W,
    channel_capacity: usize,
    max_frame_size: u32,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(channel_capacity);
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx, max_frame_size }, task)
}

/// Drain the channel, writing frames in batches with one flush per batch.
async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(frame) => frame,
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        for frame in &batch {
            writer.write_all(&frame.prefix).await?;
            writer.write_all(&frame.payload).await?;
        }
        writer.flush().await?;
    }
}
