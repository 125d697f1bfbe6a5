/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header block has no `Content-Length` header.
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// A header line could not be parsed.
    #[error("invalid frame header: {0}")]
    InvalidHeader(String),

    /// The header block exceeds the configured maximum size.
    #[error("header block too large (more than {max} bytes)")]
    HeaderTooLarge { max: usize },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True for malformed input from the peer, as opposed to I/O or
    /// end-of-stream conditions.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            FrameError::MissingContentLength
                | FrameError::InvalidHeader(_)
                | FrameError::HeaderTooLarge { .. }
                | FrameError::PayloadTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
