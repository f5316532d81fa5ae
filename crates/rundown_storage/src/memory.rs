//! The process's view of shared and private memory.

use crate::arena::Arena;
use crate::cache::CacheState;
use crate::header::{CritSection, NodeLocal, SharedHeader};
use crate::heap::PageHeap;
use crate::journal::{JournalBuffer, JournalPoolControl, JournalPrivate, ShmPool};
use crate::region::{
    Directory, DirectoryList, FileControl, RegionDescriptor, RegionState, SegmentDescriptor,
};
use crate::txn::{CommitElement, ElementArray, SubTransaction, TransactionGlobals};

/// Every arena the cleanup sweep may touch, plus the byte heap.
///
/// Fields are public so a caller can borrow several arenas at once.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedMemory {
    /// Page buffers, images, update lists and the journal ring.
    pub heap: PageHeap,
    /// Directory lists.
    pub directory_lists: Arena<DirectoryList>,
    /// Directories.
    pub directories: Arena<Directory>,
    /// Region descriptors.
    pub regions: Arena<RegionDescriptor>,
    /// Segment descriptors.
    pub segments: Arena<SegmentDescriptor>,
    /// File control blocks.
    pub files: Arena<FileControl>,
    /// Per-process region state.
    pub states: Arena<RegionState>,
    /// Shared file headers.
    pub headers: Arena<SharedHeader>,
    /// Node-local control blocks.
    pub nodes: Arena<NodeLocal>,
    /// Critical sections.
    pub crits: Arena<CritSection>,
    /// Cache states.
    pub caches: Arena<CacheState>,
    /// Journal private state.
    pub journals: Arena<JournalPrivate>,
    /// Shared journal buffers.
    pub journal_buffers: Arena<JournalBuffer>,
    /// Journal pool control blocks.
    pub journal_pools: Arena<JournalPoolControl>,
    /// Backup memory pools.
    pub pools: Arena<ShmPool>,
    /// Commit elements.
    pub elements: Arena<CommitElement>,
    /// Single-region element arrays.
    pub element_arrays: Arena<ElementArray>,
    /// Sub-transactions.
    pub subtransactions: Arena<SubTransaction>,
    /// Transaction globals.
    pub globals: Arena<TransactionGlobals>,
}

impl SharedMemory {
    /// Creates an empty memory image.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for SharedMemory {
    fn default() -> Self {
        Self {
            heap: PageHeap::new(),
            directory_lists: Arena::new(1),
            directories: Arena::new(2),
            regions: Arena::new(3),
            segments: Arena::new(4),
            files: Arena::new(5),
            states: Arena::new(6),
            headers: Arena::new(7),
            nodes: Arena::new(8),
            crits: Arena::new(9),
            caches: Arena::new(10),
            journals: Arena::new(11),
            journal_buffers: Arena::new(12),
            journal_pools: Arena::new(13),
            pools: Arena::new(14),
            elements: Arena::new(15),
            element_arrays: Arena::new(16),
            subtransactions: Arena::new(17),
            globals: Arena::new(18),
        }
    }
}
