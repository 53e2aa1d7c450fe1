//! Error taxonomy for the frame-delivery core

use thiserror::Error;

use crate::StreamId;

pub type Result<T, E = VisionError> = std::result::Result<T, E>;

/// Caller-visible failures. Anomalies in the notification path (malformed
/// envelopes, stale slots, out-of-order timestamps) are not represented here;
/// those are drop-and-recover conditions handled inside the session.
#[derive(Debug, Error)]
pub enum VisionError {
    /// Operation attempted before `connect` completed or after disconnect.
    #[error("vision service is not connected")]
    NotConnected,

    /// A session for the stream is already active.
    #[error("stream {0} is already started")]
    DuplicateStream(StreamId),

    /// No active session for the stream.
    #[error("stream {0} is not started")]
    UnknownStream(StreamId),

    /// The stream was started in push mode and has no pull buffer.
    #[error("stream {0} has no pull buffer")]
    NotBuffered(StreamId),

    /// A frame was returned to a buffer of a different stream.
    #[error("frame belongs to stream {actual}, returned to stream {expected}")]
    WrongStream {
        expected: StreamId,
        actual: StreamId,
    },

    /// Control-channel failure reported by the transport.
    #[error("transport: {0}")]
    Transport(String),
}

impl VisionError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
