//! # Rundown Storage
//!
//! Shared-memory model for the Rundown commit-completion engine.
//!
//! Everything the engine inspects after a process dies lives here: region
//! descriptors, per-process region state, shared file headers, node-local
//! control blocks, cache slots, journal buffers, the journal pool, commit
//! elements and sub-transactions.
//!
//! ## Design Principles
//!
//! - Shared structures are stored in index-addressed [`Arena`]s. A [`Ptr`] is
//!   an offset into an arena, never a raw address.
//! - Every arena slot and every [`PageHeap`] range carries [`Mapping`]
//!   metadata. Access goes through [`MemoryProbe`], which answers from that
//!   metadata and never faults.
//! - Latches are single atomic words so a dead owner can be reaped with a
//!   compare-and-swap keyed to its exact `(pid, generation)`.
//!
//! ## Example
//!
//! ```rust
//! use rundown_storage::{Access, Arena, MappingProbe, MemoryProbe, Protection};
//!
//! let mut arena = Arena::new(1);
//! let ptr = arena.alloc(42_u64);
//! let probe = MappingProbe;
//! assert_eq!(arena.probe_read(Some(ptr), &probe), Some(&42));
//!
//! arena.protect(ptr, Protection::None).unwrap();
//! assert!(arena.probe_read(Some(ptr), &probe).is_none());
//! assert!(!probe.probe(None, 0, 8, Access::Read));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod arena;
pub mod block;
mod cache;
mod error;
mod header;
mod heap;
mod journal;
mod latch;
mod memory;
mod probe;
mod region;
mod trace;
mod txn;

pub use arena::{Arena, Ptr};
pub use cache::{CacheSlot, CacheState, Twin, BLOCK_EMPTY, NO_READ_IN_PROGRESS};
pub use error::{StorageError, StorageResult};
pub use header::{BlockFormat, CritSection, NodeLocal, SharedHeader, TransHistory};
pub use heap::{HeapRange, PageHeap, HEAP_ORIGIN, HEAP_PAGE_SIZE};
pub use journal::{
    JournalBuffer, JournalPoolControl, JournalPrivate, JournalRecordHeader, ShmPool,
};
pub use latch::{Latch, LatchOwner};
pub use memory::SharedMemory;
pub use probe::{Access, Mapping, MappingProbe, MemoryProbe, PageGranularProbe, Protection};
pub use region::{
    AccessMethod, Directory, DirectoryList, FileControl, FileId, RegionDescriptor, RegionState,
    SegmentDescriptor,
};
pub use trace::{Severity, TraceEntry, TraceTable, TRACE_WORDS};
pub use txn::{
    CommitElement, CommitMode, ElementArray, InternalOp, SubTransaction, TransactionGlobals,
    UpdateState,
};
