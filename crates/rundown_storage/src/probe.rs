//! Non-faulting memory validity probes.
//!
//! A probe answers one question: is `len` bytes at `offset` inside this
//! mapping accessible with at least the requested rights? It inspects mapping
//! metadata only, so it cannot itself fault on a freed or corrupt target.

/// Access rights requested by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read access.
    Read,
    /// Read and write access.
    Write,
}

/// Protection recorded for a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Mapped but inaccessible.
    None,
    /// Readable.
    ReadOnly,
    /// Readable and writable.
    ReadWrite,
}

impl Protection {
    /// Returns true if this protection permits `access`.
    #[must_use]
    pub const fn allows(self, access: Access) -> bool {
        matches!(
            (self, access),
            (Self::ReadOnly, Access::Read) | (Self::ReadWrite, _)
        )
    }
}

/// Metadata describing one mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Base address of the range (synthetic for arena slots).
    pub base: u64,
    /// Length of the range in bytes.
    pub len: u64,
    /// Access rights.
    pub protection: Protection,
}

impl Mapping {
    /// Creates a read-write mapping.
    #[must_use]
    pub const fn read_write(base: u64, len: u64) -> Self {
        Self {
            base,
            len,
            protection: Protection::ReadWrite,
        }
    }
}

/// A memory validity check that never faults.
///
/// Implementations must reject a missing mapping, an empty range, a range
/// whose end overflows, and any access the protection does not grant.
pub trait MemoryProbe {
    /// Returns true if `len` bytes at `offset` within `mapping` are accessible
    /// with `access`.
    fn probe(&self, mapping: Option<&Mapping>, offset: u64, len: u64, access: Access) -> bool;
}

/// Probe that checks the exact extent recorded for each mapping.
///
/// This is the user-mode profile: the mapping table is the authority and a
/// range must lie entirely inside the recorded length.
#[derive(Debug, Clone, Copy, Default)]
pub struct MappingProbe;

impl MemoryProbe for MappingProbe {
    fn probe(&self, mapping: Option<&Mapping>, offset: u64, len: u64, access: Access) -> bool {
        let Some(mapping) = mapping else {
            return false;
        };
        if len == 0 || !mapping.protection.allows(access) {
            return false;
        }
        offset
            .checked_add(len)
            .is_some_and(|end| end <= mapping.len)
    }
}

/// Probe that validates at operating-system page granularity.
///
/// This is the restricted (privileged) profile. The hardware only protects
/// whole pages, so a range is accessible when every page it touches belongs
/// to the mapping, even if it runs past the recorded length inside the last
/// page. Page rounding uses shifts only: this profile runs without a runtime
/// support library, so it never divides.
#[derive(Debug, Clone, Copy)]
pub struct PageGranularProbe {
    page_shift: u32,
}

impl PageGranularProbe {
    /// Creates a probe for pages of `1 << page_shift` bytes.
    #[must_use]
    pub const fn new(page_shift: u32) -> Self {
        Self { page_shift }
    }

    /// Returns the page size in bytes.
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        1 << self.page_shift
    }

    fn round_up(&self, value: u64) -> Option<u64> {
        let mask = self.page_size() - 1;
        value
            .checked_add(mask)
            .map(|v| (v >> self.page_shift) << self.page_shift)
    }
}

impl Default for PageGranularProbe {
    fn default() -> Self {
        Self::new(12)
    }
}

impl MemoryProbe for PageGranularProbe {
    fn probe(&self, mapping: Option<&Mapping>, offset: u64, len: u64, access: Access) -> bool {
        let Some(mapping) = mapping else {
            return false;
        };
        if len == 0 || !mapping.protection.allows(access) {
            return false;
        }
        let (Some(end), Some(limit)) = (offset.checked_add(len), self.round_up(mapping.len)) else {
            return false;
        };
        end <= limit
    }
}
