//! Commit elements, sub-transactions and the process's transaction globals.

use crate::arena::Ptr;
use crate::header::BlockFormat;
use crate::heap::HeapRange;
use crate::region::{RegionDescriptor, RegionState};

/// How a commit element produces its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitMode {
    /// A newly acquired block.
    Acquired,
    /// An update to an existing block.
    Write,
    /// A rewrite of a recycled block.
    WriteRecycled,
    /// A local bitmap (free-space map) write.
    WriteMap,
    /// Already committed.
    Committed,
    /// Root pointer fixup; no page of its own (single-region only).
    WriteRoot,
    /// Busy-to-free transition; no page write (single-region only).
    BusyToFree,
    /// Kill bookkeeping for a created block; no page write.
    KillCreate,
    /// Kill bookkeeping for an existing block; no page write.
    KillWrite,
}

impl CommitMode {
    /// Returns true for modes that write a page.
    #[must_use]
    pub const fn writes_page(self) -> bool {
        matches!(
            self,
            Self::Acquired | Self::Write | Self::WriteRecycled | Self::WriteMap
        )
    }

    /// Returns true for terminal modes that only exist in single-region
    /// transactions and touch no page.
    #[must_use]
    pub const fn is_single_region_terminal(self) -> bool {
        matches!(self, Self::WriteRoot | Self::BusyToFree)
    }

    /// Returns true for multi-region kill bookkeeping modes.
    #[must_use]
    pub const fn is_kill(self) -> bool {
        matches!(self, Self::KillCreate | Self::KillWrite)
    }
}

/// Progress of the process's update transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateState {
    /// No update in progress.
    #[default]
    Idle,
    /// Building the write set.
    Updating,
    /// Commit passed the point of no return.
    CommitStarted,
}

/// Internal (non-user) operation in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InternalOp {
    /// None.
    #[default]
    None,
    /// Bitmap mark-free on behalf of the database engine.
    BitmapMarkFree,
    /// Bitmap mark-free on behalf of reorg.
    ReorgMarkFree,
    /// Generic block mark-free (recycled blocks).
    BlockMarkFree,
    /// Any other internal operation.
    Other,
}

impl InternalOp {
    /// Returns true for bitmap mark-free operations, which may free legacy
    /// format blocks.
    #[must_use]
    pub const fn is_bitmap_mark_free(self) -> bool {
        matches!(self, Self::BitmapMarkFree | Self::ReorgMarkFree)
    }
}

/// One block's worth of deferred commit work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommitElement {
    /// Target block.
    pub block: u32,
    /// Current mode.
    pub mode: CommitMode,
    /// Mode before the element was marked committed.
    pub prior_mode: Option<CommitMode>,
    /// Heap address of the before-image (bitmap writes copy it first).
    pub before_image: Option<u64>,
    /// Prebuilt image (multi-region elements already built elsewhere).
    pub new_image: Option<u64>,
    /// Update records, or the bitmap's block list.
    pub update: Option<HeapRange>,
    /// Offset of a parent pointer placeholder to patch, or 0.
    pub ins_off: u32,
    /// Index of the element whose block number fills the placeholder.
    pub index: i32,
    /// First link of the in-page fixup chain, or 0.
    pub first_off: u32,
    /// Next link to record at `ins_off`.
    pub next_off: u32,
    /// Net blocks taken from the free count (negative frees blocks).
    pub reference_delta: i32,
    /// The page was already built into `new_image`.
    pub done: bool,
    /// Format of the block on disk before this commit.
    pub ondisk_format: BlockFormat,
    /// Journal address of this update.
    pub journal_addr: u64,
    /// Tree level of the block.
    pub level: u8,
    /// Cache slot the live writer used, if any.
    pub cache_slot: Option<u32>,
    /// Newer version of the same slot at a deeper nesting level.
    pub newer: Option<Ptr<CommitElement>>,
    /// Next element of the sub-transaction.
    pub next: Option<Ptr<CommitElement>>,
}

impl CommitElement {
    /// Creates an element with no links and no fixups.
    #[must_use]
    pub fn new(block: u32, mode: CommitMode) -> Self {
        Self {
            block,
            mode,
            prior_mode: None,
            before_image: None,
            new_image: None,
            update: None,
            ins_off: 0,
            index: 0,
            first_off: 0,
            next_off: 0,
            reference_delta: 0,
            done: false,
            ondisk_format: BlockFormat::Current,
            journal_addr: 0,
            level: 0,
            cache_slot: None,
            newer: None,
            next: None,
        }
    }

    /// Returns true if the element has been committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.mode == CommitMode::Committed
    }

    /// Marks the element committed, keeping the previous mode as history.
    pub fn mark_committed(&mut self) {
        if self.mode != CommitMode::Committed {
            self.prior_mode = Some(self.mode);
            self.mode = CommitMode::Committed;
        }
    }
}

/// Write set of a single-region transaction, in commit order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ElementArray {
    /// Elements; `CommitElement::index` refers to positions here.
    pub elements: Vec<Ptr<CommitElement>>,
}

/// One region's share of a multi-region transaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubTransaction {
    /// Region this sub-transaction updates.
    pub region: Option<Ptr<RegionDescriptor>>,
    /// First element.
    pub first: Option<Ptr<CommitElement>>,
    /// Number of elements.
    pub depth: u32,
    /// Update state of this region's share.
    pub update_state: UpdateState,
    /// Next sub-transaction in cross-process lock order (file order).
    pub next_by_file: Option<Ptr<SubTransaction>>,
    /// The transaction queued blocks for a kill.
    pub kill_set_present: bool,
    /// The kill has been counted in `kill_in_progress`.
    pub kill_counted: bool,
}

impl SubTransaction {
    /// Creates a sub-transaction with no elements.
    #[must_use]
    pub fn new(region: Ptr<RegionDescriptor>) -> Self {
        Self {
            region: Some(region),
            first: None,
            depth: 0,
            update_state: UpdateState::Idle,
            next_by_file: None,
            kill_set_present: false,
            kill_counted: false,
        }
    }
}

/// Process-wide transaction state read by the cleanup sweep.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransactionGlobals {
    /// Multi-region nesting depth; 0 outside a multi-region transaction.
    pub tp_depth: u16,
    /// First sub-transaction in file order.
    pub first_by_file: Option<Ptr<SubTransaction>>,
    /// Update state of the single-region transaction.
    pub update_state: UpdateState,
    /// Region state of the single-region transaction.
    pub current_region: Option<Ptr<RegionState>>,
    /// Write set of the single-region transaction.
    pub elements: Option<Ptr<ElementArray>>,
    /// Number of valid entries in `elements`.
    pub element_depth: u8,
    /// The current kill has been counted in `kill_in_progress`.
    pub kill_counted: bool,
    /// The current kill still needs counting.
    pub kill_pending: bool,
    /// Internal operation in progress.
    pub internal_op: InternalOp,
    /// Block the internal operation works on.
    pub internal_op_block: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_classes_are_disjoint() {
        let all = [
            CommitMode::Acquired,
            CommitMode::Write,
            CommitMode::WriteRecycled,
            CommitMode::WriteMap,
            CommitMode::Committed,
            CommitMode::WriteRoot,
            CommitMode::BusyToFree,
            CommitMode::KillCreate,
            CommitMode::KillWrite,
        ];
        for mode in all {
            let classes = [
                mode.writes_page(),
                mode.is_single_region_terminal(),
                mode.is_kill(),
                mode == CommitMode::Committed,
            ];
            assert_eq!(classes.iter().filter(|&&c| c).count(), 1, "{mode:?}");
        }
    }

    #[test]
    fn mark_committed_keeps_history_once() {
        let mut cse = CommitElement::new(5, CommitMode::Write);
        cse.mark_committed();
        cse.mark_committed();
        assert!(cse.is_committed());
        assert_eq!(cse.prior_mode, Some(CommitMode::Write));
    }

    #[test]
    fn bitmap_mark_free_ops() {
        assert!(InternalOp::BitmapMarkFree.is_bitmap_mark_free());
        assert!(InternalOp::ReorgMarkFree.is_bitmap_mark_free());
        assert!(!InternalOp::BlockMarkFree.is_bitmap_mark_free());
    }
}
