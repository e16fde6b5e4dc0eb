//! `tokio_util::codec` adapter for 07.10 frames.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::codec::{decode_frame, encode_frame, Frame, FrameConfig};
use crate::error::FrameError;

/// Frame codec for `FramedRead` / `FramedWrite` over an async byte stream.
///
/// Corrupt frames are logged and skipped; only I/O errors end the stream.
#[derive(Debug, Clone, Default)]
pub struct CmuxCodec {
    config: FrameConfig,
}

impl CmuxCodec {
    pub fn new(config: FrameConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Decoder for CmuxCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            match decode_frame(src, &self.config) {
                Ok(frame) => return Ok(frame),
                Err(err) if err.is_recoverable() => {
                    warn!(error = %err, "dropping corrupt frame");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // A lone flag or line noise at EOF is not an error.
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for CmuxCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_frame(&frame, &self.config, dst)
    }
}
