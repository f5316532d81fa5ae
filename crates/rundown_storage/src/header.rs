//! Shared file header, node-local control block and critical section.

use crate::latch::Latch;
use crate::region::AccessMethod;
use crate::trace::TraceTable;

/// On-disk block format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockFormat {
    /// Previous format; blocks in it are counted as needing upgrade.
    Legacy,
    /// Current format.
    #[default]
    Current,
}

/// Transaction history kept in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransHistory {
    /// Commit counter of the last completed commit.
    pub current: u64,
    /// Commit counter a writer advances before committing.
    ///
    /// Equal to `current` except during a commit, where it is `current + 1`.
    pub next: u64,
    /// Free-block count.
    pub free_blocks: i64,
    /// Total blocks in the file.
    pub total_blocks: u32,
}

impl TransHistory {
    /// Returns true if a commit advanced `next` but never `current`.
    #[must_use]
    pub fn has_gap(&self) -> bool {
        self.next.checked_sub(1) == Some(self.current)
    }
}

/// Header shared by every process attached to a region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SharedHeader {
    /// Access method the file was created with.
    pub access_method: AccessMethod,
    /// Block size in bytes.
    pub block_size: u32,
    /// Number of cache slots (buffered regions).
    pub cache_slots: u32,
    /// Transaction history.
    pub history: TransHistory,
    /// Blocks still in the legacy format.
    pub blocks_to_upgrade: i64,
    /// Kills whose second phase has not completed.
    pub kill_in_progress: u32,
    /// Sticky flag forcing the next lock holder to rebuild the cache.
    pub cache_blocked: bool,
    /// Format new and rewritten blocks are written in.
    pub desired_format: BlockFormat,
    /// Journaling is enabled.
    pub journal_enabled: bool,
    /// Pid holding a freeze, or 0.
    pub freeze_owner: u32,
    /// Generation of the freeze holder.
    pub freeze_generation: u32,
    /// Blocks covered by one local bitmap.
    pub blocks_per_map: u32,
}

impl Default for SharedHeader {
    fn default() -> Self {
        Self {
            access_method: AccessMethod::Buffered,
            block_size: 512,
            cache_slots: 0,
            history: TransHistory::default(),
            blocks_to_upgrade: 0,
            kill_in_progress: 0,
            cache_blocked: false,
            desired_format: BlockFormat::Current,
            journal_enabled: false,
            freeze_owner: 0,
            freeze_generation: 0,
            blocks_per_map: 512,
        }
    }
}

/// Node-local control block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeLocal {
    /// Pid recorded as holding the write lock, or 0.
    pub write_lock_owner: u32,
    /// Latch protecting the cache bookkeeping counters.
    pub cache_var_latch: Latch,
    /// Pid currently flushing the cache, or 0.
    pub flush_owner: u32,
    /// Outstanding flush timers across processes.
    pub flush_timers: i32,
    /// Processes attached read-write.
    pub attach_count: i32,
    /// Processes inside a write-start pass.
    pub writers_active: i32,
    /// Slot index where the next victim scan starts.
    pub lru_cursor: u32,
    /// An online backup is running.
    pub backup_in_progress: bool,
    /// Accounting trace written by the cleanup sweep.
    pub accounting: TraceTable,
    /// Times the cache was blocked because the dying process held the lock.
    pub blocked_by_holder: u32,
    /// Times the cache was blocked because a write buffer was dequeued.
    pub blocked_by_dequeue: u32,
    /// Times the shared-memory pool was blocked by cleanup.
    pub pool_blocked_by_cleanup: u32,
}

/// The region's critical section.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CritSection {
    /// Write-lock latch.
    pub write_latch: Latch,
    /// Processes holding the read lock.
    pub readers: u32,
    /// Crash generation; incremented whenever a holder is found dead.
    pub crash_count: u32,
    /// Wake-up semaphore latch.
    pub semaphore: Latch,
    /// Latch guarding `crash_count`.
    pub crash_count_latch: Latch,
    /// Latch guarding the waiter queue.
    pub process_queue_latch: Latch,
    /// Latch guarding the free waiter-entry queue.
    pub free_queue_latch: Latch,
}
