//! Journal buffers, the shared journal pool and the backup memory pool.

use crate::arena::Ptr;
use crate::latch::Latch;

/// Shared journal buffer of one region.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JournalBuffer {
    /// Held while an fsync is running.
    pub fsync_latch: Latch,
    /// Held while a disk write is in flight.
    pub io_latch: Latch,
    /// Buffer offset written to disk.
    pub disk_offset: u32,
    /// Journal file address written to disk.
    pub disk_addr: u64,
    /// Buffer offset of the next free byte.
    pub free_offset: u32,
    /// Journal file address of the next free byte.
    pub free_addr: u64,
    /// Pid updating `free_offset`/`free_addr`, or 0.
    pub free_update_pid: u32,
    /// Pid blocking writers, or 0.
    pub blocked_pid: u32,
}

/// Private journal state of one process for one region.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JournalPrivate {
    /// Shared journal buffer.
    pub buffer: Option<Ptr<JournalBuffer>>,
    /// A disk write finished but the shared pointers were not advanced.
    pub disk_update_pending: bool,
    /// Disk offset to publish.
    pub new_disk_offset: u32,
    /// Disk address to publish.
    pub new_disk_addr: u64,
    /// Free offset to publish.
    pub pending_free_offset: u32,
    /// Free address to publish.
    pub pending_free_addr: u64,
}

/// Control block of the append-only journal ring shared by all regions that
/// take part in group commit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JournalPoolControl {
    /// Heap address of the ring data.
    pub ring_base: u64,
    /// Ring capacity in bytes.
    pub capacity: u32,
    /// Ring offset of the next record header.
    pub write: u32,
    /// Durable (published) write address.
    pub write_addr: u64,
    /// Write address reserved by a committer before publishing.
    pub early_write_addr: u64,
    /// Sequence number of the next record.
    pub seqno: u64,
    /// Length of the last published record.
    pub last_write_len: u32,
}

/// Header preceding every record in the journal ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JournalRecordHeader {
    /// Length of this record.
    pub length: u32,
    /// Length of the previous record.
    pub prev_length: u32,
}

impl JournalRecordHeader {
    /// Encoded size in bytes.
    pub const SIZE: u64 = 8;

    /// Decodes a header from the first eight bytes of `bytes`.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let length = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
        let prev_length = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
        Some(Self {
            length,
            prev_length,
        })
    }

    /// Encodes the header into the first eight bytes of `bytes`.
    pub fn encode(&self, bytes: &mut [u8]) -> bool {
        let Some(dst) = bytes.get_mut(0..8) else {
            return false;
        };
        dst[0..4].copy_from_slice(&self.length.to_le_bytes());
        dst[4..8].copy_from_slice(&self.prev_length.to_le_bytes());
        true
    }
}

/// Shared-memory pool used by online backup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShmPool {
    /// Latch guarding the pool.
    pub crit_latch: Latch,
    /// Set when the pool must be recovered before reuse.
    pub blocked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_codec() {
        let header = JournalRecordHeader {
            length: 0x1234,
            prev_length: 7,
        };
        let mut buf = [0u8; 8];
        assert!(header.encode(&mut buf));
        assert_eq!(JournalRecordHeader::decode(&buf), Some(header));
    }

    #[test]
    fn header_codec_rejects_short_buffers() {
        let mut buf = [0u8; 7];
        assert!(!JournalRecordHeader::default().encode(&mut buf));
        assert_eq!(JournalRecordHeader::decode(&buf), None);
    }
}
