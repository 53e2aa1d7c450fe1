//! Fixed-layout frame metadata shared across the IPC boundary
//!
//! The layout is owned by the service contract, not by this crate: all
//! fields little-endian, 40-byte minimum header. A malformed envelope is a
//! droppable condition, never fatal - the producer may have raced us on a
//! recycled slot.

use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::StreamId;

/// Minimum metadata region size.
pub const ENVELOPE_LEN: usize = 40;

/// Pixel formats delivered by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuv420,
    Yv12,
    Gray8,
    Rgb24,
    Depth16,
}

impl PixelFormat {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Yuv420),
            2 => Some(Self::Yv12),
            3 => Some(Self::Gray8),
            4 => Some(Self::Rgb24),
            5 => Some(Self::Depth16),
            _ => None,
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            Self::Yuv420 => 1,
            Self::Yv12 => 2,
            Self::Gray8 => 3,
            Self::Rgb24 => 4,
            Self::Depth16 => 5,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("metadata region too short: {0} bytes")]
    Truncated(usize),
    #[error("unknown pixel format {0}")]
    UnknownFormat(u32),
}

/// Decoded frame metadata. Immutable once parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEnvelope {
    pub stream: StreamId,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub payload_len: u32,
    /// Wall-clock capture time, nanoseconds.
    pub platform_ts: u64,
    /// Monotonic IMU-clock value used to detect duplicate and out-of-order
    /// delivery. Zero means the producer did not stamp the frame.
    pub ordering_ts: u64,
}

impl FrameEnvelope {
    pub fn parse(mut buf: &[u8]) -> Result<Self, EnvelopeError> {
        if buf.len() < ENVELOPE_LEN {
            return Err(EnvelopeError::Truncated(buf.len()));
        }
        let stream = StreamId(buf.get_u32_le());
        let raw_format = buf.get_u32_le();
        let format = PixelFormat::from_raw(raw_format)
            .ok_or(EnvelopeError::UnknownFormat(raw_format))?;
        let width = buf.get_u32_le();
        let height = buf.get_u32_le();
        let payload_len = buf.get_u32_le();
        let _reserved = buf.get_u32_le();
        let platform_ts = buf.get_u64_le();
        let ordering_ts = buf.get_u64_le();
        Ok(Self {
            stream,
            format,
            width,
            height,
            payload_len,
            platform_ts,
            ordering_ts,
        })
    }

    /// Producer-side encoding, used when writing a slot's metadata region.
    pub fn encode(&self) -> [u8; ENVELOPE_LEN] {
        let mut out = [0u8; ENVELOPE_LEN];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.stream.0);
        buf.put_u32_le(self.format.to_raw());
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.payload_len);
        buf.put_u32_le(0);
        buf.put_u64_le(self.platform_ts);
        buf.put_u64_le(self.ordering_ts);
        out
    }
}

impl fmt::Display for FrameEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream {} {:?} {}x{} ts {}",
            self.stream, self.format, self.width, self.height, self.ordering_ts
        )
    }
}
