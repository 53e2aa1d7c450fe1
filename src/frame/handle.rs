//! Reference-counted frame handles backed by producer-owned slots

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::frame::envelope::FrameEnvelope;
use crate::shm::region::MappedRegion;
use crate::{SlotIndex, StreamId};

/// Hands a slot back to the producer once the last holder is done with it.
pub trait SlotReleaser: Send + Sync {
    fn release_slot(&self, stream: StreamId, slot: SlotIndex);
}

pub type FrameRef = Arc<Frame>;

/// One accepted frame: envelope plus the mapped image region it describes.
///
/// The hold count starts at 1 for the side that admitted the frame (the pull
/// buffer, or the push delivery). `get_latest` adds a hold, `return_frame`
/// drops one; when the count reaches zero the slot is released to the
/// producer. Frame data must not be touched after the last hold is dropped -
/// the producer is free to overwrite the slot from that point on.
pub struct Frame {
    envelope: FrameEnvelope,
    region: Arc<MappedRegion>,
    stream: StreamId,
    slot: SlotIndex,
    holds: AtomicU32,
    releaser: Arc<dyn SlotReleaser>,
}

impl Frame {
    pub(crate) fn new(
        envelope: FrameEnvelope,
        region: Arc<MappedRegion>,
        stream: StreamId,
        slot: SlotIndex,
        releaser: Arc<dyn SlotReleaser>,
    ) -> FrameRef {
        Arc::new(Self {
            envelope,
            region,
            stream,
            slot,
            holds: AtomicU32::new(1),
            releaser,
        })
    }

    pub fn envelope(&self) -> &FrameEnvelope {
        &self.envelope
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    /// Raw pixel payload.
    pub fn data(&self) -> &[u8] {
        &self.region.as_bytes()[..self.envelope.payload_len as usize]
    }

    /// Current number of holders.
    pub fn ref_count(&self) -> u32 {
        self.holds.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self) {
        self.holds.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one hold. Releasing a frame whose count already reached zero is a
    /// contract violation in the caller and aborts rather than corrupting the
    /// slot arena.
    pub(crate) fn release(&self) {
        let prev = self.holds.fetch_sub(1, Ordering::AcqRel);
        match prev {
            0 => panic!(
                "frame for stream {} slot {} released twice",
                self.stream, self.slot
            ),
            1 => {
                trace!(
                    "frame for stream {} slot {} fully returned",
                    self.stream,
                    self.slot
                );
                self.releaser.release_slot(self.stream, self.slot);
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("stream", &self.stream)
            .field("slot", &self.slot)
            .field("holds", &self.ref_count())
            .field("envelope", &self.envelope)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::sync::Mutex;

    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

    use super::*;
    use crate::frame::envelope::PixelFormat;
    use crate::shm::region::RegionKind;

    /// Records every slot release, for asserting release-exactly-once.
    #[derive(Default)]
    pub struct RecordingReleaser {
        pub released: Mutex<Vec<(StreamId, SlotIndex)>>,
    }

    impl SlotReleaser for RecordingReleaser {
        fn release_slot(&self, stream: StreamId, slot: SlotIndex) {
            self.released.lock().unwrap().push((stream, slot));
        }
    }

    pub fn test_frame(
        stream: StreamId,
        slot: SlotIndex,
        ordering_ts: u64,
        releaser: Arc<RecordingReleaser>,
    ) -> FrameRef {
        let payload = b"test pixels";
        let name = std::ffi::CString::new("argus-test-frame").unwrap();
        let fd = memfd_create(name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC).unwrap();
        let mut file = File::from(fd);
        file.write_all(payload).unwrap();
        let region =
            MappedRegion::map(file.as_fd(), payload.len(), RegionKind::Image).unwrap();
        let envelope = FrameEnvelope {
            stream,
            format: PixelFormat::Gray8,
            width: 11,
            height: 1,
            payload_len: payload.len() as u32,
            platform_ts: 0,
            ordering_ts,
        };
        Frame::new(envelope, Arc::new(region), stream, slot, releaser)
    }
}
