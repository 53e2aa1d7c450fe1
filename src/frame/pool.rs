//! Per-stream pull buffer
//!
//! Holds the single most recent accepted frame for a stream. A newly
//! accepted frame always replaces the retained one; the replaced frame only
//! flows back to the producer once every outstanding holder has returned it.

use std::sync::Mutex;

use tracing::debug;

use crate::error::{Result, VisionError};
use crate::frame::handle::FrameRef;
use crate::StreamId;

#[derive(Debug)]
pub struct FrameBuffer {
    stream: StreamId,
    latest: Mutex<Option<FrameRef>>,
}

impl FrameBuffer {
    pub fn new(stream: StreamId) -> Self {
        Self {
            stream,
            latest: Mutex::new(None),
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Adopt `frame` as the latest, dropping the buffer's hold on any
    /// unclaimed predecessor.
    pub(crate) fn push(&self, frame: FrameRef) {
        let prev = self.latest.lock().unwrap().replace(frame);
        if let Some(prev) = prev {
            debug!(
                "stream {} replacing unclaimed frame ts {}",
                self.stream,
                prev.envelope().ordering_ts
            );
            metrics::counter!("argus_frames_superseded").increment(1);
            prev.release();
        }
    }

    /// The latest accepted, not-yet-replaced frame, retained for the caller.
    /// `None` until the first frame for the stream is admitted.
    pub fn get_latest(&self) -> Option<FrameRef> {
        let latest = self.latest.lock().unwrap();
        latest.as_ref().map(|frame| {
            frame.retain();
            frame.clone()
        })
    }

    /// Return a frame obtained from `get_latest`, dropping the caller's hold.
    pub fn return_frame(&self, frame: &FrameRef) -> Result<()> {
        if frame.stream() != self.stream {
            return Err(VisionError::WrongStream {
                expected: self.stream,
                actual: frame.stream(),
            });
        }
        frame.release();
        Ok(())
    }

    /// Drop the buffer's hold on the retained frame. Outstanding consumer
    /// holds keep the frame alive until they are returned.
    pub(crate) fn clear(&self) {
        if let Some(prev) = self.latest.lock().unwrap().take() {
            prev.release();
        }
    }
}
