//! Cache slots for buffered regions.

use crate::header::BlockFormat;
use crate::latch::Latch;

/// Block number marking an empty slot.
pub const BLOCK_EMPTY: u32 = u32::MAX;

/// `read_in_progress` value meaning no read is outstanding.
pub const NO_READ_IN_PROGRESS: i32 = -1;

/// Secondary link held by a cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Twin {
    /// No link.
    #[default]
    None,
    /// Another slot holding an older version of the same block.
    CacheRecord(u32),
    /// Heap address of a before-image stashed by the cleanup sweep.
    ///
    /// Only meaningful on a slot whose `stopped` flag is set; cache recovery
    /// backs the image up and clears the link.
    BeforeImage(u64),
}

/// One cached page.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSlot {
    /// Block held, or [`BLOCK_EMPTY`].
    pub block: u32,
    /// Page differs from disk.
    pub dirty: bool,
    /// Page is part of an active transaction's write set.
    pub in_transaction: bool,
    /// Pid reading the page in, or [`NO_READ_IN_PROGRESS`].
    pub read_in_progress: i32,
    /// Page was written by the cleanup sweep; cache recovery must finish it.
    pub stopped: bool,
    /// Bumped whenever the slot changes blocks.
    pub cycle: u32,
    /// Pid that issued the last read into this slot.
    pub reader_pid: u32,
    /// Latch held while a read is in flight.
    pub read_latch: Latch,
    /// A writer was mid-way through committing into this slot.
    pub in_commit: bool,
    /// Format of the page on disk.
    pub ondisk_format: BlockFormat,
    /// Journal address of the last update.
    pub journal_addr: u64,
    /// Heap address of the page buffer.
    pub buffer: u64,
    /// Secondary link.
    pub twin: Twin,
}

impl CacheSlot {
    /// Creates an empty slot backed by `buffer`.
    #[must_use]
    pub fn empty(buffer: u64) -> Self {
        Self {
            block: BLOCK_EMPTY,
            dirty: false,
            in_transaction: false,
            read_in_progress: NO_READ_IN_PROGRESS,
            stopped: false,
            cycle: 0,
            reader_pid: 0,
            read_latch: Latch::new(),
            in_commit: false,
            ondisk_format: BlockFormat::Current,
            journal_addr: 0,
            buffer,
            twin: Twin::None,
        }
    }

    /// Returns the stashed before-image address, if this is a stopped slot
    /// carrying one.
    #[must_use]
    pub fn stashed_before_image(&self) -> Option<u64> {
        match self.twin {
            Twin::BeforeImage(addr) if self.stopped => Some(addr),
            _ => None,
        }
    }
}

/// Cache bookkeeping for a buffered region.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CacheState {
    /// Latch on the active-write queue.
    pub queue_latch: Latch,
    /// Slots, one per cached page.
    pub slots: Vec<CacheSlot>,
}

impl CacheState {
    /// Probe extent covering the state and `count` slots.
    #[must_use]
    pub fn extent(count: u32) -> u64 {
        std::mem::size_of::<Self>() as u64
            + u64::from(count) * std::mem::size_of::<CacheSlot>() as u64
    }
}
