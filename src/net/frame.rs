//! Length-prefixed frame codec.
//!
//! A frame is `[4-byte big-endian length N][N bytes payload]`. The decoder
//! keeps partial data in the `BytesMut` between reads and yields each complete
//! frame exactly once.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Default upper bound on a single frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Errors produced while framing.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Codec for `[len][payload]` frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Validate the declared length without consuming anything.
    ///
    /// Returns `Ok(None)` while fewer than 4 bytes are buffered.
    fn check(&self, buffer: &BytesMut) -> Result<Option<usize>, ProtocolError> {
        if buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&buffer[..LENGTH_PREFIX]);
        let declared = i32::from_be_bytes(prefix);
        if declared < 0 {
            return Err(ProtocolError::NegativeFrameLength(declared));
        }
        let length = declared as usize;
        if length > self.max_frame_length {
            return Err(ProtocolError::FrameTooLarge {
                length,
                max: self.max_frame_length,
            });
        }
        Ok(Some(length))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let Some(length) = self.check(src)? else {
            return Ok(None);
        };

        if src.len() < LENGTH_PREFIX + length {
            // Bounded by max_frame_length via check().
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        // i32::MAX bound keeps the prefix readable as a non-negative signed length.
        let max = self.max_frame_length.min(i32::MAX as usize);
        if payload.len() > max {
            return Err(ProtocolError::FrameTooLarge {
                length: payload.len(),
                max,
            }
            .into());
        }
        dst.reserve(LENGTH_PREFIX + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
