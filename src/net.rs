//! Transports. Each accepted connection becomes a client with two tasks: a
//! recv loop decoding inbound messages for the server and a send task
//! draining the client's outbound queue in submission order.

use thiserror::Error;

use crate::api::schema::CodecError;

pub mod framing;
pub mod tcp;
pub mod ws;

#[derive(Debug, Error)]
pub enum NetError {
    /// The peer closed or reset the stream.
    #[error("peer disconnected")]
    Disconnected,
    #[error("frame of {0} bytes exceeds the {max} byte limit", max = framing::MAX_FRAME_LEN)]
    FrameTooLarge(usize),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
