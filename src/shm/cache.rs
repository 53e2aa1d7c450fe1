//! Mapping cache keyed by (stream, slot, kind)
//!
//! OS-level mappings are a scarce resource and the producer recycles a small
//! fixed set of slots, so repeated notifications for the same slot reuse the
//! cached mapping instead of paying the mmap syscall again. The number of
//! live mappings is bounded by the number of distinct keys in flight.

use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::shm::region::{MappedRegion, RegionKind};
use crate::{SlotIndex, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionKey {
    pub stream: StreamId,
    pub slot: SlotIndex,
    pub kind: RegionKind,
}

#[derive(Debug, Default)]
pub struct RegionCache {
    entries: Mutex<HashMap<RegionKey, Arc<MappedRegion>>>,
}

impl RegionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached mapping for `key`, or a freshly mapped one. `None` means the
    /// OS map call failed and the caller must drop the frame (releasing the
    /// slot), never treat it as fatal.
    pub fn map(&self, key: RegionKey, fd: BorrowedFd<'_>, len: usize) -> Option<Arc<MappedRegion>> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(region) = entries.get(&key) {
            return Some(region.clone());
        }
        match MappedRegion::map(fd, len, key.kind) {
            Ok(region) => {
                let region = Arc::new(region);
                // Insert replaces any stale entry, so at most one live
                // mapping exists per key.
                entries.insert(key, region.clone());
                debug!(
                    "mapped {:?} region for stream {} slot {} ({} bytes)",
                    key.kind, key.stream, key.slot, len
                );
                Some(region)
            }
            Err(e) => {
                warn!(
                    "failed to map {:?} region for stream {} slot {}: {}",
                    key.kind, key.stream, key.slot, e
                );
                metrics::counter!("argus_region_map_failures").increment(1);
                None
            }
        }
    }

    /// Drop every cached mapping for one stream. Called on stream stop and
    /// whenever an anomaly suggests the stream's slots were recycled under
    /// us; the few extra remaps afterwards are the price of correctness.
    pub fn invalidate_stream(&self, stream: StreamId) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|key, _| key.stream != stream);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("evicted {} cached mappings for stream {}", evicted, stream);
        }
        evicted
    }

    /// Drop every cached mapping. Called on disconnect.
    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let evicted = entries.len();
        entries.clear();
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::AsFd;

    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

    use super::*;

    fn memfd_with(contents: &[u8]) -> File {
        let name = std::ffi::CString::new("argus-test-cache").unwrap();
        let fd = memfd_create(name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC).unwrap();
        let mut file = File::from(fd);
        file.write_all(contents).unwrap();
        file
    }

    fn key(stream: u32, slot: SlotIndex, kind: RegionKind) -> RegionKey {
        RegionKey {
            stream: StreamId(stream),
            slot,
            kind,
        }
    }

    #[test]
    fn second_map_hits_cache() {
        let cache = RegionCache::new();
        let file = memfd_with(b"payload");
        let first = cache
            .map(key(1, 0, RegionKind::Image), file.as_fd(), 7)
            .unwrap();
        let second = cache
            .map(key(1, 0, RegionKind::Image), file.as_fd(), 7)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn image_and_metadata_are_distinct_keys() {
        let cache = RegionCache::new();
        let file = memfd_with(b"payload");
        cache.map(key(1, 0, RegionKind::Image), file.as_fd(), 7);
        cache.map(key(1, 0, RegionKind::Metadata), file.as_fd(), 7);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalidate_stream_leaves_other_streams() {
        let cache = RegionCache::new();
        let file = memfd_with(b"payload");
        cache.map(key(1, 0, RegionKind::Image), file.as_fd(), 7);
        cache.map(key(1, 1, RegionKind::Image), file.as_fd(), 7);
        cache.map(key(2, 0, RegionKind::Image), file.as_fd(), 7);
        assert_eq!(cache.invalidate_stream(StreamId(1)), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate_all(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn map_failure_yields_none() {
        let cache = RegionCache::new();
        let file = memfd_with(b"payload");
        assert!(cache
            .map(key(1, 0, RegionKind::Image), file.as_fd(), 0)
            .is_none());
        assert!(cache.is_empty());
    }
}
