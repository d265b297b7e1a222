//! ## Veil edge protocol framing
//!
//! Every byte that travels between the SDK and an edge router is wrapped in
//! a length-prefixed frame: a fixed magic, a content code, the body and
//! header-block lengths, a sequence number, then a list of TLV headers and
//! the body itself. One TLS connection carries many logical connections, so
//! the demultiplexing key (the conn-id header) and the request/reply
//! correlation key (the reply-for header) both live in the header block.
//!
//! The codec is allocation-free for decoding metadata; bodies are copied out
//! of the transport buffer exactly once. `Message::message_size` lets a
//! transport discover frame boundaries in a partially-read buffer without
//! committing to a full decode.

pub mod message;
pub mod pool;

pub use self::{
    message::{ContentType, Header, Message, header},
    pool::{Pool, PoolBuf},
};

use std::{array::TryFromSliceError, str::Utf8Error};

/// Frame magic, the first four bytes of every message.
pub const MAGIC: [u8; 4] = *b"veil";

/// Fixed part of the frame: magic, content, body length, header-block
/// length, sequence.
pub const FRAME_HEADER_SIZE: usize = 20;

/// Largest accepted frame (headers plus body). Anything larger is treated
/// as a protocol violation rather than buffered.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    InvalidInput,
    NotFoundMagicNumber,
    UnknownContentType(u32),
    Oversized(usize),
    Utf8Error(Utf8Error),
    TryFromSliceError,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(_: TryFromSliceError) -> Self {
        Self::TryFromSliceError
    }
}
