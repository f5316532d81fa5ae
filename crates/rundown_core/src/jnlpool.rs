//! Journal-pool tail fixup.
//!
//! A committer reserves space in the journal ring by advancing
//! `early_write_addr`, writes its record, and then publishes by writing the
//! record header and advancing `write_addr`. A process that dies between
//! the two leaves a reserved but unpublished tail, which the sweep
//! publishes on its behalf when its commit is being rolled forward.

use crate::config::ExecutionProfile;
use rundown_storage::{JournalPoolControl, JournalRecordHeader, MemoryProbe, Ptr, SharedMemory};

/// Wraps a ring offset into `0..capacity`.
///
/// The restricted profile avoids the remainder operator and subtracts
/// instead. A zero capacity yields 0.
///
/// ```rust
/// use rundown_core::{wrap_offset, ExecutionProfile};
///
/// assert_eq!(wrap_offset(70, 32, ExecutionProfile::Restricted), 6);
/// assert_eq!(wrap_offset(70, 32, ExecutionProfile::Unrestricted), 6);
/// ```
#[must_use]
pub fn wrap_offset(offset: u64, capacity: u32, profile: ExecutionProfile) -> u32 {
    if capacity == 0 {
        return 0;
    }
    let capacity = u64::from(capacity);
    let wrapped = match profile {
        ExecutionProfile::Unrestricted => offset % capacity,
        ExecutionProfile::Restricted => {
            let mut offset = offset;
            while offset >= capacity {
                offset -= capacity;
            }
            offset
        }
    };
    // Below capacity, which is a u32.
    wrapped as u32
}

/// Outcome of [`complete_tail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tail {
    /// Nothing was reserved beyond the published address.
    Idle,
    /// The reserved record was published.
    Completed { length: u32 },
    /// The control block or the record header could not be written.
    Unwritable,
}

/// Publishes the record between `write_addr` and `early_write_addr`.
pub(crate) fn complete_tail(
    mem: &mut SharedMemory,
    control: Option<Ptr<JournalPoolControl>>,
    profile: ExecutionProfile,
    probe: &dyn MemoryProbe,
) -> Tail {
    let Some(ctl) = mem.journal_pools.probe_write(control, probe) else {
        return Tail::Unwritable;
    };
    if ctl.early_write_addr <= ctl.write_addr {
        return Tail::Idle;
    }
    let Ok(length) = u32::try_from(ctl.early_write_addr - ctl.write_addr) else {
        return Tail::Unwritable;
    };
    if ctl.capacity == 0 {
        return Tail::Unwritable;
    }
    let Some(at) = ctl.ring_base.checked_add(u64::from(ctl.write)) else {
        return Tail::Unwritable;
    };
    let header = JournalRecordHeader {
        length,
        prev_length: ctl.last_write_len,
    };
    let written = mem
        .heap
        .probe_write(at, JournalRecordHeader::SIZE, probe)
        .is_some_and(|bytes| header.encode(bytes));
    if !written {
        return Tail::Unwritable;
    }
    ctl.last_write_len = length;
    ctl.write = wrap_offset(
        u64::from(ctl.write) + u64::from(length),
        ctl.capacity,
        profile,
    );
    ctl.write_addr = ctl.write_addr.wrapping_add(u64::from(length));
    ctl.seqno = ctl.seqno.wrapping_add(1);
    Tail::Completed { length }
}
