//! Byte heap holding page buffers, before-images, update arrays and the
//! journal ring.
//!
//! Addresses are plain `u64` values starting at [`HEAP_ORIGIN`]; address 0 is
//! never mapped. Each mapping is page aligned, like an operating-system
//! mapping, and is looked up by address when probed.

use crate::error::{StorageError, StorageResult};
use crate::probe::{Access, Mapping, MemoryProbe, Protection};
use std::collections::BTreeMap;

/// First address handed out by the heap.
pub const HEAP_ORIGIN: u64 = 0x1_0000;

/// Alignment of heap mappings.
pub const HEAP_PAGE_SIZE: u64 = 4096;

/// Largest single mapping the heap will create.
const MAX_MAPPING: u64 = 1 << 30;

/// A `(address, length)` pair naming bytes in a [`PageHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapRange {
    /// Start address.
    pub addr: u64,
    /// Length in bytes.
    pub len: u32,
}

impl HeapRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

/// Address-space stand-in for the byte-oriented shared memory.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageHeap {
    bytes: Vec<u8>,
    maps: BTreeMap<u64, Mapping>,
}

impl PageHeap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `len` zeroed bytes and returns the base address.
    pub fn map(&mut self, len: u64, protection: Protection) -> StorageResult<u64> {
        if len == 0 || len > MAX_MAPPING {
            return Err(StorageError::InvalidLength { len });
        }
        let base = HEAP_ORIGIN + self.bytes.len() as u64;
        let reserved = len.div_ceil(HEAP_PAGE_SIZE) * HEAP_PAGE_SIZE;
        self.bytes.resize(self.bytes.len() + reserved as usize, 0);
        self.maps.insert(
            base,
            Mapping {
                base,
                len,
                protection,
            },
        );
        Ok(base)
    }

    /// Maps a copy of `data` read-write and returns the base address.
    pub fn map_bytes(&mut self, data: &[u8]) -> StorageResult<u64> {
        let base = self.map(data.len() as u64, Protection::ReadWrite)?;
        let start = (base - HEAP_ORIGIN) as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(base)
    }

    /// Removes the mapping that starts at `base`.
    pub fn unmap(&mut self, base: u64) -> StorageResult<()> {
        self.maps
            .remove(&base)
            .map(|_| ())
            .ok_or(StorageError::UnmappedAddress { addr: base, len: 0 })
    }

    /// Changes the protection of the mapping that starts at `base`.
    pub fn protect(&mut self, base: u64, protection: Protection) -> StorageResult<()> {
        let mapping = self
            .maps
            .get_mut(&base)
            .ok_or(StorageError::UnmappedAddress { addr: base, len: 0 })?;
        mapping.protection = protection;
        Ok(())
    }

    /// Finds the mapping containing `addr`, returning it with the offset of
    /// `addr` inside it. The offset may lie past the mapping's end; the probe
    /// decides.
    #[must_use]
    pub fn mapping_at(&self, addr: u64) -> Option<(&Mapping, u64)> {
        let (_, mapping) = self.maps.range(..=addr).next_back()?;
        Some((mapping, addr - mapping.base))
    }

    /// Probes `len` bytes at `addr`.
    #[must_use]
    pub fn probe(&self, addr: u64, len: u64, access: Access, probe: &dyn MemoryProbe) -> bool {
        match self.mapping_at(addr) {
            Some((mapping, offset)) => probe.probe(Some(mapping), offset, len, access),
            None => probe.probe(None, 0, len, access),
        }
    }

    fn index(&self, addr: u64, len: u64) -> Option<std::ops::Range<usize>> {
        let start = addr.checked_sub(HEAP_ORIGIN)?;
        let end = start.checked_add(len)?;
        if end > self.bytes.len() as u64 {
            return None;
        }
        Some(start as usize..end as usize)
    }

    /// Probes `len` bytes at `addr` for reading and returns them.
    #[must_use]
    pub fn probe_read(&self, addr: u64, len: u64, probe: &dyn MemoryProbe) -> Option<&[u8]> {
        if !self.probe(addr, len, Access::Read, probe) {
            return None;
        }
        let range = self.index(addr, len)?;
        Some(&self.bytes[range])
    }

    /// Probes `len` bytes at `addr` for writing and returns them.
    pub fn probe_write(
        &mut self,
        addr: u64,
        len: u64,
        probe: &dyn MemoryProbe,
    ) -> Option<&mut [u8]> {
        if !self.probe(addr, len, Access::Write, probe) {
            return None;
        }
        let range = self.index(addr, len)?;
        Some(&mut self.bytes[range])
    }

    /// Probes a source range for reading and a disjoint destination range for
    /// writing, returning both.
    pub fn probe_split(
        &mut self,
        src: HeapRange,
        dst: HeapRange,
        probe: &dyn MemoryProbe,
    ) -> Option<(&[u8], &mut [u8])> {
        let src_len = u64::from(src.len);
        let dst_len = u64::from(dst.len);
        if !self.probe(src.addr, src_len, Access::Read, probe)
            || !self.probe(dst.addr, dst_len, Access::Write, probe)
        {
            return None;
        }
        let s = self.index(src.addr, src_len)?;
        let d = self.index(dst.addr, dst_len)?;
        if s.start < d.end && d.start < s.end {
            return None;
        }
        if s.start < d.start {
            let (lo, hi) = self.bytes.split_at_mut(d.start);
            Some((&lo[s], &mut hi[..d.end - d.start]))
        } else {
            let (lo, hi) = self.bytes.split_at_mut(s.start);
            Some((&hi[..s.end - s.start], &mut lo[d]))
        }
    }

    /// Copies `len` bytes from `src` to `dst` after probing both.
    pub fn probe_copy(&mut self, src: u64, dst: u64, len: u64, probe: &dyn MemoryProbe) -> bool {
        if !self.probe(src, len, Access::Read, probe) || !self.probe(dst, len, Access::Write, probe)
        {
            return false;
        }
        match (self.index(src, len), self.index(dst, len)) {
            (Some(s), Some(d)) => {
                self.bytes.copy_within(s, d.start);
                true
            }
            _ => false,
        }
    }

    /// Returns bytes without probing. Fixture and test use only.
    pub fn bytes(&self, addr: u64, len: u64) -> StorageResult<&[u8]> {
        let range = self
            .index(addr, len)
            .ok_or(StorageError::UnmappedAddress { addr, len })?;
        Ok(&self.bytes[range])
    }

    /// Returns bytes mutably without probing. Fixture and test use only.
    pub fn bytes_mut(&mut self, addr: u64, len: u64) -> StorageResult<&mut [u8]> {
        let range = self
            .index(addr, len)
            .ok_or(StorageError::UnmappedAddress { addr, len })?;
        Ok(&mut self.bytes[range])
    }
}
