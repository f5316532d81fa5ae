//! Region, segment and file descriptors, and the per-process region state.

use crate::arena::Ptr;
use crate::cache::CacheState;
use crate::header::{CritSection, NodeLocal, SharedHeader};
use crate::journal::{JournalPoolControl, JournalPrivate, ShmPool};

/// How a region's blocks reach memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMethod {
    /// Blocks live in a managed cache of slots.
    Buffered,
    /// Blocks are views directly into the mapped file.
    MemoryMapped,
    /// Anything else; skipped by the cleanup sweep.
    Unsupported,
}

/// Identity of the physical database file behind a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

/// An ordered list of directories the process has open.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DirectoryList {
    /// Directories in enumeration order.
    pub directories: Vec<Ptr<Directory>>,
}

/// A global directory: a named set of regions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Directory {
    /// Directory name.
    pub name: String,
    /// Regions in directory order.
    pub regions: Vec<Ptr<RegionDescriptor>>,
}

/// A named database region as seen through one directory.
///
/// Several descriptors may resolve to the same [`FileControl`] when more than
/// one directory maps the same physical file.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionDescriptor {
    /// Region name.
    pub name: String,
    /// Whether the region has been opened by this process.
    pub open: bool,
    /// Set on aliases whose file was already opened through another
    /// descriptor; such descriptors are not processed.
    pub was_open: bool,
    /// Whether the process opened the region read-only.
    pub read_only: bool,
    /// Segment descriptor.
    pub segment: Option<Ptr<SegmentDescriptor>>,
    /// Size of the shared section (node-local plus cache); zero is unusable.
    pub shared_size: u64,
}

/// Segment descriptor: access method and file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentDescriptor {
    /// Access method.
    pub access_method: AccessMethod,
    /// File control block.
    pub file: Option<Ptr<FileControl>>,
}

/// File control block shared by every descriptor that maps the same file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileControl {
    /// Physical file identity.
    pub file_id: FileId,
    /// The process's private state for this file.
    pub state: Option<Ptr<RegionState>>,
}

/// Private, per-process state for one open region.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegionState {
    /// Shared file header.
    pub header: Option<Ptr<SharedHeader>>,
    /// Node-local control block.
    pub node: Option<Ptr<NodeLocal>>,
    /// Critical section holding the region lock.
    pub crit: Option<Ptr<CritSection>>,
    /// Cache state (buffered regions).
    pub cache: Option<Ptr<CacheState>>,
    /// Journal private state.
    pub journal: Option<Ptr<JournalPrivate>>,
    /// Shared-memory pool used by online backup.
    pub pool: Option<Ptr<ShmPool>>,
    /// Journal-pool control block (journal-pool region only).
    pub journal_pool: Option<Ptr<JournalPoolControl>>,
    /// Heap address of block 0 (memory-mapped regions).
    pub mapped_base: u64,
    /// The process holds the region write lock.
    pub holds_write_lock: bool,
    /// The process entered the irrevocable per-block commit loop.
    pub commit_in_progress: bool,
    /// The process holds the region read lock.
    pub holds_read_lock: bool,
    /// The region was opened read-write.
    pub read_write: bool,
    /// A cache write buffer was dequeued and not yet requeued.
    pub write_dequeued: bool,
    /// The process is inside a write-start pass.
    pub in_write_start: bool,
    /// A flush timer is pending for this process.
    pub timer_pending: bool,
    /// Attach references this process holds on the region.
    pub attach_refs: u32,
    /// Free-block count recorded when the commit started.
    pub prev_free_blocks: i64,
    /// The process froze the region.
    pub freeze_held: bool,
    /// The freeze survives process exit.
    pub persistent_freeze: bool,
}
