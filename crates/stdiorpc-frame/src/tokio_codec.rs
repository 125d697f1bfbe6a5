use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, FrameConfig};
use crate::error::FrameError;

/// `tokio_util` codec for `Content-Length` framed payloads.
///
/// Pairs with `FramedRead`/`FramedWrite` over async stdio handles; this is
/// how a byte stream is decoded into payloads.
#[derive(Debug, Clone, Default)]
pub struct ContentLengthCodec {
    config: FrameConfig,
}

impl ContentLengthCodec {
    /// Create a codec with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with explicit limits.
    pub fn with_config(config: FrameConfig) -> Self {
        Self { config }
    }

    /// Current codec configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Decoder for ContentLengthCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src, &self.config)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(payload) => Ok(Some(payload)),
            None if src.is_empty() => Ok(None),
            None => {
                tracing::debug!(buffered = src.len(), "stream ended mid-frame");
                Err(FrameError::ConnectionClosed)
            }
        }
    }
}

impl Encoder<Bytes> for ContentLengthCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: item.len(),
                max: self.config.max_payload_size,
            });
        }
        encode_frame(&item, dst);
        Ok(())
    }
}
