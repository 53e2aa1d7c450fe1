//! Owned mappings of producer shared-memory handles

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use memmap2::{Mmap, MmapOptions};

/// Which half of a slot a mapping covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Image,
    Metadata,
}

/// A read-only mapping of one shared-memory handle. The mapping is torn down
/// exactly once, when the last `Arc` holding the region drops.
pub struct MappedRegion {
    map: Mmap,
    kind: RegionKind,
}

impl MappedRegion {
    /// Map `len` bytes of `fd` into the process. The fd may be closed after
    /// this returns; the mapping keeps the region alive on its own.
    pub fn map(fd: BorrowedFd<'_>, len: usize, kind: RegionKind) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-length shared-memory region",
            ));
        }
        // Safety: the producer owns the region for the lifetime of the slot;
        // we only ever map it read-only.
        let map = unsafe { MmapOptions::new().len(len).map(fd.as_raw_fd())? };
        Ok(Self { map, kind })
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.map
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("kind", &self.kind)
            .field("len", &self.map.len())
            .finish()
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
        let name = std::ffi::CString::new("argus-test-region").unwrap();
        let fd = memfd_create(name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC).unwrap();
        let mut file = File::from(fd);
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn maps_written_bytes() {
        let file = memfd_with(b"frame payload");
        let region = MappedRegion::map(file.as_fd(), 13, RegionKind::Image).unwrap();
        assert_eq!(region.as_bytes(), b"frame payload");
        assert_eq!(region.len(), 13);
        assert_eq!(region.kind(), RegionKind::Image);
    }

    #[test]
    fn mapping_survives_fd_close() {
        let file = memfd_with(b"still here");
        let region = MappedRegion::map(file.as_fd(), 10, RegionKind::Metadata).unwrap();
        drop(file);
        assert_eq!(region.as_bytes(), b"still here");
    }

    #[test]
    fn rejects_zero_length() {
        let file = memfd_with(b"x");
        assert!(MappedRegion::map(file.as_fd(), 0, RegionKind::Image).is_err());
    }
}
