//! Wire protocol: message schema and length-prefixed framing.

mod frame;
mod message;

pub use frame::{build_frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
pub use message::{
    ErrorKind, Message, Publish, Register, Reply, ReplyOutcome, Request, Subscribe,
    PROTOCOL_VERSION,
};
