//! Content-Length message framing for stdio RPC streams.
//!
//! Every message on the wire is a header block followed by a payload:
//! - One or more `Key: value` header lines, each terminated by `\r\n`
//! - A mandatory `Content-Length` header carrying the payload byte count
//! - An empty `\r\n` line ending the header block
//!
//! Unknown headers are ignored. Callers always get complete payloads,
//! regardless of how the underlying stream chunks its reads.

pub mod codec;
pub mod error;

#[cfg(feature = "async")]
pub mod tokio_codec;

pub use codec::{
    decode_frame, encode_frame, FrameConfig, CONTENT_LENGTH, DEFAULT_MAX_HEADER, DEFAULT_MAX_PAYLOAD,
};
pub use error::{FrameError, Result};

#[cfg(feature = "async")]
pub use tokio_codec::ContentLengthCodec;
