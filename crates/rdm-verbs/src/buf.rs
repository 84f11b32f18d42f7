//! Registered memory types.
//!
//! `RdmaBuf` is host memory owned by one connection; `MemoryRegion` is the
//! registration the device handed back for it; `RemoteRegion` is what a peer
//! learns about one of our regions through the handshake.

use serde::{Deserialize, Serialize};

use crate::error::{VerbsError, VerbsResult};

/// Access rights requested when registering a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const LOCAL_WRITE: AccessFlags = AccessFlags(1);
    pub const REMOTE_WRITE: AccessFlags = AccessFlags(1 << 1);
    pub const REMOTE_READ: AccessFlags = AccessFlags(1 << 2);

    pub fn empty() -> Self {
        AccessFlags(0)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        AccessFlags(self.0 | rhs.0)
    }
}

/// Zeroed host memory destined for registration.
#[derive(Debug)]
pub struct RdmaBuf {
    data: Vec<u8>,
}

impl RdmaBuf {
    /// Allocate `size` zeroed bytes, reporting allocator failure instead of
    /// aborting.
    pub fn try_allocate(size: usize) -> VerbsResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| VerbsError::OutOfMemory { size })?;
        data.resize(size, 0);
        Ok(Self { data })
    }

    /// Virtual address of the first byte, as handed to the device.
    pub fn addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A device registration covering one `RdmaBuf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    /// Start address of the registered range.
    pub addr: u64,
    /// Length of the registered range in bytes.
    pub length: usize,
    /// Key for local work requests.
    pub lkey: u32,
    /// Key a peer uses for remote access.
    pub rkey: u32,
}

impl MemoryRegion {
    /// The remote view of this region.
    pub fn remote(&self) -> RemoteRegion {
        RemoteRegion {
            rkey: self.rkey,
            addr: self.addr,
        }
    }

    /// Address of slot `index` when the region is carved into equal slots.
    pub fn slot_addr(&self, index: usize, slot_len: usize) -> u64 {
        self.addr + (index * slot_len) as u64
    }
}

/// A peer region reachable by remote writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRegion {
    pub rkey: u32,
    pub addr: u64,
}

impl RemoteRegion {
    /// Whether the peer has told us about this region yet.
    pub fn valid(&self) -> bool {
        self.addr != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_flags() {
        let flags = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
        assert!(flags.contains(AccessFlags::LOCAL_WRITE));
        assert!(flags.contains(AccessFlags::REMOTE_WRITE));
        assert!(!flags.contains(AccessFlags::REMOTE_READ));
        assert_eq!(AccessFlags::empty().bits(), 0);
    }

    #[test]
    fn test_rdma_buf_allocate() {
        let buf = RdmaBuf::try_allocate(4096).unwrap();
        assert_eq!(buf.len(), 4096);
        assert!(!buf.is_empty());
        assert!(buf.as_slice().iter().all(|b| *b == 0));
        assert_ne!(buf.addr(), 0);
    }

    #[test]
    fn test_rdma_buf_huge_allocation_fails() {
        let err = RdmaBuf::try_allocate(usize::MAX).unwrap_err();
        assert_eq!(err, VerbsError::OutOfMemory { size: usize::MAX });
    }

    #[test]
    fn test_memory_region_slots() {
        let mr = MemoryRegion {
            addr: 0x1000,
            length: 4 * 256,
            lkey: 3,
            rkey: 4,
        };
        assert_eq!(mr.slot_addr(0, 256), 0x1000);
        assert_eq!(mr.slot_addr(3, 256), 0x1300);
        assert_eq!(mr.remote(), RemoteRegion { rkey: 4, addr: 0x1000 });
    }

    #[test]
    fn test_remote_region_valid() {
        assert!(!RemoteRegion::default().valid());
        assert!(RemoteRegion { rkey: 1, addr: 8 }.valid());
    }
}
