use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// The one header every frame must carry. Matched case-sensitively.
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default maximum header block size: 8 KiB.
pub const DEFAULT_MAX_HEADER: usize = 8 * 1024;

const LINE_END: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Maximum size of the header block, excluding the blank line. Default: 8 KiB.
    pub max_header_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_header_size: DEFAULT_MAX_HEADER,
        }
    }
}

/// Encode a payload into the wire format.
///
/// Wire format:
/// ```text
/// Content-Length: <N>\r\n
/// \r\n
/// <N payload bytes>
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) {
    let len = payload.len().to_string();
    dst.reserve(CONTENT_LENGTH.len() + 2 + len.len() + HEADER_END.len() + payload.len());
    dst.put_slice(CONTENT_LENGTH.as_bytes());
    dst.put_slice(b": ");
    dst.put_slice(len.as_bytes());
    dst.put_slice(HEADER_END);
    dst.put_slice(payload);
}

/// Decode a frame payload from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet; the
/// buffer is left untouched in that case. On success, consumes the header
/// block and payload from the buffer.
pub fn decode_frame(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Bytes>> {
    let Some((block_len, body_start)) = find_header_end(src, config.max_header_size)? else {
        return Ok(None); // Need more data
    };

    let content_length = parse_header_block(&src[..block_len])?;
    if content_length > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: content_length,
            max: config.max_payload_size,
        });
    }

    if src.len() < body_start + content_length {
        return Ok(None); // Need more data
    }

    src.advance(body_start);
    Ok(Some(src.split_to(content_length).freeze()))
}

/// Locate the end of the header block.
///
/// Returns `(block_len, body_start)`: the length of the header lines without
/// the terminating blank line, and the offset at which the payload begins.
fn find_header_end(src: &[u8], max_header: usize) -> Result<Option<(usize, usize)>> {
    if src.starts_with(LINE_END) {
        return Ok(Some((0, LINE_END.len())));
    }

    match src
        .windows(HEADER_END.len())
        .position(|window| window == HEADER_END)
    {
        Some(pos) if pos > max_header => Err(FrameError::HeaderTooLarge { max: max_header }),
        Some(pos) => Ok(Some((pos, pos + HEADER_END.len()))),
        None if src.len() > max_header + HEADER_END.len() => {
            Err(FrameError::HeaderTooLarge { max: max_header })
        }
        None => Ok(None),
    }
}

fn parse_header_block(block: &[u8]) -> Result<usize> {
    if block.is_empty() {
        return Err(FrameError::MissingContentLength);
    }

    let text = std::str::from_utf8(block)
        .map_err(|_| FrameError::InvalidHeader("header block is not valid UTF-8".to_string()))?;

    let mut content_length = None;
    for line in text.split("\r\n") {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::InvalidHeader(format!("malformed header line {line:?}")))?;

        if key != CONTENT_LENGTH {
            tracing::trace!(header = key, "ignoring frame header");
            continue;
        }

        if content_length.is_some() {
            return Err(FrameError::InvalidHeader(
                "duplicate Content-Length header".to_string(),
            ));
        }

        let value = value.trim();
        let parsed = value.parse::<usize>().map_err(|_| {
            FrameError::InvalidHeader(format!("invalid Content-Length value {value:?}"))
        })?;
        content_length = Some(parsed);
    }

    content_length.ok_or(FrameError::MissingContentLength)
}
