pub mod envelope;
pub mod handle;
pub mod pool;

pub use envelope::{EnvelopeError, FrameEnvelope, PixelFormat, ENVELOPE_LEN};
pub use handle::{Frame, FrameRef, SlotReleaser};
pub use pool::FrameBuffer;
