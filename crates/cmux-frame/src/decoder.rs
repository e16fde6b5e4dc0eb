use bytes::BytesMut;
use tracing::{trace, warn};

use crate::codec::{decode_frame, skip_to_flag, Frame, FrameConfig};
use crate::error::{FrameError, Result};

/// Counters kept by a [`FrameDecoder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Frames decoded successfully.
    pub frames: u64,
    /// Frames dropped because the FCS did not match.
    pub checksum_errors: u64,
    /// Frames dropped for any other reason (bad address, length, type...).
    pub decode_errors: u64,
    /// Bytes discarded while hunting for a flag or on overflow.
    pub dropped_bytes: u64,
}

/// Incremental frame decoder over a bounded re-assembly buffer.
///
/// Bytes are pushed as they arrive from the wire, frames are pulled as soon
/// as they are complete. Corrupt frames are reported as recoverable errors
/// and never stop the decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    capacity: usize,
    config: FrameConfig,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// Create a decoder whose re-assembly buffer holds `capacity` bytes.
    pub fn new(config: FrameConfig, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            config,
            stats: DecoderStats::default(),
        }
    }

    /// Free space in the re-assembly buffer.
    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    /// Append received bytes.
    ///
    /// If they do not fit, the buffered partial frame is discarded and
    /// decoding resynchronises within the new bytes.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        let mut overflow = None;
        if data.len() > self.free_space() {
            let dropped = self.buf.len();
            self.buf.clear();
            self.stats.dropped_bytes += dropped as u64;
            overflow = Some(dropped);
        }

        let take = data.len().min(self.capacity);
        let skipped = data.len() - take;
        self.stats.dropped_bytes += skipped as u64;
        self.buf.extend_from_slice(&data[skipped..]);

        match overflow {
            Some(dropped) => {
                warn!(dropped, "frame re-assembly buffer overflow");
                Err(FrameError::BufferOverflow {
                    dropped: dropped + skipped,
                })
            }
            None => Ok(()),
        }
    }

    /// Pull the next complete frame.
    ///
    /// Returns `None` when more input is needed. Errors are per-frame and
    /// recoverable: call again to continue with the following bytes.
    pub fn next_frame(&mut self) -> Option<Result<Frame>> {
        let garbage = skip_to_flag(&mut self.buf, self.config.flag());
        if garbage > 0 {
            trace!(bytes = garbage, "skipped bytes outside frames");
            self.stats.dropped_bytes += garbage as u64;
        }

        match decode_frame(&mut self.buf, &self.config) {
            Ok(Some(frame)) => {
                self.stats.frames += 1;
                Some(Ok(frame))
            }
            Ok(None) => None,
            Err(err) => {
                match err {
                    FrameError::Checksum { .. } => self.stats.checksum_errors += 1,
                    _ => self.stats.decode_errors += 1,
                }
                Some(Err(err))
            }
        }
    }

    /// Discard buffered bytes, e.g. when the link is reset.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Iterator for FrameDecoder {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }
}
