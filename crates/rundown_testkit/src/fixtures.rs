//! Crash scenario fixtures.
//!
//! [`ScenarioBuilder`] lays out a complete shared-memory image the way a
//! process would leave it when dying at a chosen point: open regions with
//! their headers, node-local blocks, critical sections and caches, a
//! single- or multi-region write set, and optionally a journal pool.
//!
//! Fixtures allocate through the unprobed arena API and panic on misuse.

use rundown_core::{
    encode_records, CleanupContext, CleanupReason, Config, CoreResult, DiagSite, LivenessOracle,
    Rundown, RundownReport,
};
use rundown_storage::{
    AccessMethod, CacheSlot, CacheState, CommitElement, CommitMode, CritSection, Directory,
    DirectoryList, ElementArray, FileControl, FileId, HeapRange, JournalPoolControl, Latch,
    LatchOwner, MemoryProbe, NodeLocal, Protection, Ptr, RegionDescriptor, RegionState,
    SegmentDescriptor, SharedHeader, SharedMemory, SubTransaction, TraceTable, TransHistory,
    TransactionGlobals, UpdateState,
};

/// Pid of the process the scenarios run as.
pub const PID: u32 = 42;

/// Generation of [`PID`].
pub const GENERATION: u32 = 1;

/// Block size of every fixture region.
pub const BLOCK_SIZE: u32 = 512;

/// Entries in each node-local trace table.
pub const TRACE_CAPACITY: usize = 32;

/// Shape of one region.
#[derive(Debug, Clone, Copy)]
pub struct RegionSpec {
    /// Access method.
    pub access_method: AccessMethod,
    /// Blocks mapped for memory-mapped regions.
    pub blocks: u32,
    /// Cache slots for buffered regions.
    pub cache_slots: u32,
    /// Commit counters and free count.
    pub history: TransHistory,
    /// The process's state in the region; handles are filled in.
    pub state: RegionState,
}

impl RegionSpec {
    /// A memory-mapped region with 16 blocks that the process has open
    /// read-write and is not using.
    #[must_use]
    pub fn mapped() -> Self {
        Self {
            access_method: AccessMethod::MemoryMapped,
            blocks: 16,
            cache_slots: 0,
            history: TransHistory {
                current: 10,
                next: 10,
                free_blocks: 100,
                total_blocks: 16,
            },
            state: RegionState {
                read_write: true,
                ..RegionState::default()
            },
        }
    }

    /// A buffered region with `slots` cache slots.
    #[must_use]
    pub fn buffered(slots: u32) -> Self {
        Self {
            access_method: AccessMethod::Buffered,
            cache_slots: slots,
            ..Self::mapped()
        }
    }

    /// The process died inside the per-block commit loop: write lock held,
    /// `next` advanced and the free count partly updated.
    #[must_use]
    pub fn in_commit(mut self) -> Self {
        self.state.holds_write_lock = true;
        self.state.commit_in_progress = true;
        self.state.prev_free_blocks = self.history.free_blocks;
        self.history.next = self.history.current + 1;
        self
    }

    /// The process holds the write lock but never started committing.
    #[must_use]
    pub fn write_locked(mut self) -> Self {
        self.state.holds_write_lock = true;
        self
    }
}

/// Handles to one fixture region.
#[derive(Debug, Clone, Copy)]
pub struct RegionHandles {
    /// Region descriptor.
    pub descriptor: Ptr<RegionDescriptor>,
    /// Segment descriptor, shared by aliases.
    pub segment: Ptr<SegmentDescriptor>,
    /// Process state.
    pub state: Ptr<RegionState>,
    /// Shared header.
    pub header: Ptr<SharedHeader>,
    /// Node-local control block.
    pub node: Ptr<NodeLocal>,
    /// Critical section.
    pub crit: Ptr<CritSection>,
    /// Cache (buffered regions).
    pub cache: Option<Ptr<CacheState>>,
    /// Address of block 0 (memory-mapped regions).
    pub base: u64,
}

impl RegionHandles {
    /// Returns block `block` of a memory-mapped region.
    #[must_use]
    pub fn page<'m>(&self, mem: &'m SharedMemory, block: u32) -> &'m [u8] {
        let addr = self.base + u64::from(block) * u64::from(BLOCK_SIZE);
        mem.heap.bytes(addr, u64::from(BLOCK_SIZE)).expect("page mapped")
    }

    /// Returns the page of the cache slot holding `block`, if any.
    #[must_use]
    pub fn cached_page<'m>(&self, mem: &'m SharedMemory, block: u32) -> Option<&'m [u8]> {
        let cache = mem.caches.get(self.cache?).ok()?;
        let slot = cache.slots.iter().find(|slot| slot.block == block)?;
        mem.heap.bytes(slot.buffer, u64::from(BLOCK_SIZE)).ok()
    }

    /// Returns the shared header.
    #[must_use]
    pub fn header<'m>(&self, mem: &'m SharedMemory) -> &'m SharedHeader {
        mem.headers.get(self.header).expect("header allocated")
    }

    /// Returns the process state.
    #[must_use]
    pub fn state<'m>(&self, mem: &'m SharedMemory) -> &'m RegionState {
        mem.states.get(self.state).expect("state allocated")
    }

    /// Returns true if the region's trace table holds an entry for `site`.
    #[must_use]
    pub fn traced(&self, mem: &SharedMemory, site: DiagSite) -> bool {
        mem.nodes
            .get(self.node)
            .expect("node allocated")
            .accounting
            .newest_first()
            .any(|entry| entry.site == site.code())
    }
}

/// One commit element to lay out.
#[derive(Debug, Clone)]
pub struct ElementSpec {
    /// Target block.
    pub block: u32,
    /// Mode.
    pub mode: CommitMode,
    /// Update records.
    pub records: Vec<Vec<u8>>,
    /// Net blocks taken from the free count.
    pub delta: i32,
    /// Pointer placeholder offset and the index of the element that fills it.
    pub insert: Option<(u32, i32)>,
    /// Already committed by the dead writer.
    pub committed: bool,
}

impl ElementSpec {
    /// An element in `mode` for `block` with no records.
    #[must_use]
    pub fn new(block: u32, mode: CommitMode) -> Self {
        Self {
            block,
            mode,
            records: Vec::new(),
            delta: 0,
            insert: None,
            committed: false,
        }
    }

    /// Update of an existing block.
    #[must_use]
    pub fn write(block: u32) -> Self {
        Self::new(block, CommitMode::Write)
    }

    /// Newly acquired block, taking one from the free count.
    #[must_use]
    pub fn acquired(block: u32) -> Self {
        Self::new(block, CommitMode::Acquired).delta(1)
    }

    /// Sets the records.
    #[must_use]
    pub fn records(mut self, records: &[&[u8]]) -> Self {
        self.records = records.iter().map(|r| r.to_vec()).collect();
        self
    }

    /// Sets the free-count delta.
    #[must_use]
    pub fn delta(mut self, delta: i32) -> Self {
        self.delta = delta;
        self
    }

    /// Fills the word at `off` with the block number of element `index`.
    #[must_use]
    pub fn insert(mut self, off: u32, index: i32) -> Self {
        self.insert = Some((off, index));
        self
    }

    /// Marks the element as committed before the crash.
    #[must_use]
    pub fn committed(mut self) -> Self {
        self.committed = true;
        self
    }
}

/// A laid-out crash image and the context to sweep it with.
#[derive(Debug)]
pub struct Scenario {
    /// The memory image.
    pub mem: SharedMemory,
    /// The invoking process.
    pub ctx: CleanupContext,
}

impl Scenario {
    /// Runs one sweep.
    pub fn run(
        &mut self,
        config: Config,
        probe: &dyn MemoryProbe,
        oracle: &dyn LivenessOracle,
    ) -> CoreResult<RundownReport> {
        Rundown::new(config, probe, oracle).run(&mut self.mem, &self.ctx)
    }
}

/// Builds a [`Scenario`].
#[derive(Debug)]
pub struct ScenarioBuilder {
    mem: SharedMemory,
    process: LatchOwner,
    directories: Ptr<DirectoryList>,
    globals: Ptr<TransactionGlobals>,
    journal_pool: Option<Ptr<RegionDescriptor>>,
    next_file: u64,
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScenarioBuilder {
    /// Starts an image with one empty directory, running as [`PID`].
    #[must_use]
    pub fn new() -> Self {
        let mut mem = SharedMemory::new();
        let directory = mem.directories.alloc(Directory {
            name: "main".into(),
            regions: Vec::new(),
        });
        let directories = mem.directory_lists.alloc(DirectoryList {
            directories: vec![directory],
        });
        let globals = mem.globals.alloc(TransactionGlobals::default());
        Self {
            mem,
            process: LatchOwner::new(PID, GENERATION),
            directories,
            globals,
            journal_pool: None,
            next_file: 1,
        }
    }

    /// Direct access to the image for adjustments the builder does not
    /// cover.
    pub fn mem(&mut self) -> &mut SharedMemory {
        &mut self.mem
    }

    /// The process's transaction globals.
    #[must_use]
    pub fn globals(&self) -> Ptr<TransactionGlobals> {
        self.globals
    }

    /// Adds a region to the first directory.
    pub fn region(&mut self, spec: RegionSpec) -> RegionHandles {
        let handles = self.alloc_region(spec);
        self.push_to_directory(0, handles.descriptor);
        handles
    }

    fn alloc_region(&mut self, spec: RegionSpec) -> RegionHandles {
        let mem = &mut self.mem;
        let header = mem.headers.alloc(SharedHeader {
            access_method: spec.access_method,
            block_size: BLOCK_SIZE,
            cache_slots: spec.cache_slots,
            history: spec.history,
            ..SharedHeader::default()
        });
        let node = mem.nodes.alloc(NodeLocal {
            accounting: TraceTable::with_capacity(TRACE_CAPACITY),
            ..NodeLocal::default()
        });
        let write_latch = if spec.state.holds_write_lock {
            Latch::held_by(LatchOwner::new(self.process.pid, 0))
        } else {
            Latch::new()
        };
        let crit = mem.crits.alloc(CritSection {
            write_latch,
            readers: u32::from(spec.state.holds_read_lock),
            ..CritSection::default()
        });

        let (cache, base) = match spec.access_method {
            AccessMethod::Buffered => {
                let slots = (0..spec.cache_slots)
                    .map(|_| {
                        let buffer = mem
                            .heap
                            .map(u64::from(BLOCK_SIZE), Protection::ReadWrite)
                            .expect("slot buffer");
                        CacheSlot::empty(buffer)
                    })
                    .collect();
                let cache = mem.caches.alloc_sized(
                    CacheState {
                        queue_latch: Latch::new(),
                        slots,
                    },
                    CacheState::extent(spec.cache_slots),
                    Protection::ReadWrite,
                );
                (Some(cache), 0)
            }
            _ => {
                let len = u64::from(spec.blocks.max(1)) * u64::from(BLOCK_SIZE);
                let base = mem.heap.map(len, Protection::ReadWrite).expect("mapped file");
                (None, base)
            }
        };

        let state = mem.states.alloc(RegionState {
            header: Some(header),
            node: Some(node),
            crit: Some(crit),
            cache,
            mapped_base: base,
            ..spec.state
        });
        let file = mem.files.alloc(FileControl {
            file_id: FileId(self.next_file),
            state: Some(state),
        });
        self.next_file += 1;
        let segment = mem.segments.alloc(SegmentDescriptor {
            access_method: spec.access_method,
            file: Some(file),
        });
        let descriptor = mem.regions.alloc(RegionDescriptor {
            name: format!("REG{}", file.index()),
            open: true,
            was_open: false,
            read_only: !spec.state.read_write,
            segment: Some(segment),
            shared_size: CacheState::extent(spec.cache_slots) + 4096,
        });
        RegionHandles {
            descriptor,
            segment,
            state,
            header,
            node,
            crit,
            cache,
            base,
        }
    }

    fn push_to_directory(&mut self, index: usize, descriptor: Ptr<RegionDescriptor>) {
        let count = self.mem.directory_lists.get(self.directories).expect("list").directories.len();
        for n in count..=index {
            let directory = self.mem.directories.alloc(Directory {
                name: format!("dir{n}"),
                regions: Vec::new(),
            });
            self.mem
                .directory_lists
                .get_mut(self.directories)
                .expect("list")
                .directories
                .push(directory);
        }
        let directory = self.mem.directory_lists.get(self.directories).expect("list").directories[index];
        self.mem
            .directories
            .get_mut(directory)
            .expect("directory")
            .regions
            .push(descriptor);
    }

    /// Adds a second descriptor for the same file to another directory.
    ///
    /// The alias is marked as already open, as a process that opened the
    /// file through `region`'s directory first would see it.
    pub fn alias(&mut self, region: &RegionHandles) -> Ptr<RegionDescriptor> {
        let alias = self.mem.regions.alloc(RegionDescriptor {
            name: "ALIAS".into(),
            open: true,
            was_open: true,
            read_only: false,
            segment: Some(region.segment),
            shared_size: 4096,
        });
        self.push_to_directory(1, alias);
        alias
    }

    /// Lays out one element.
    pub fn element(&mut self, spec: &ElementSpec) -> Ptr<CommitElement> {
        let mut cse = CommitElement::new(spec.block, spec.mode);
        if !spec.records.is_empty() {
            let refs: Vec<&[u8]> = spec.records.iter().map(Vec::as_slice).collect();
            let bytes = encode_records(&refs);
            let addr = self.mem.heap.map_bytes(&bytes).expect("update records");
            cse.update = Some(HeapRange::new(addr, bytes.len() as u32));
        }
        cse.reference_delta = spec.delta;
        if let Some((off, index)) = spec.insert {
            cse.ins_off = off;
            cse.index = index;
        }
        if spec.committed {
            cse.mark_committed();
        }
        self.mem.elements.alloc(cse)
    }

    /// Makes `region` the current region of a single-region transaction
    /// with `elements`, past its commit point.
    pub fn single_region_commit(&mut self, region: &RegionHandles, elements: &[ElementSpec]) -> Ptr<ElementArray> {
        let ptrs = elements.iter().map(|spec| self.element(spec)).collect();
        let array = self.mem.element_arrays.alloc(ElementArray { elements: ptrs });
        let globals = self.mem.globals.get_mut(self.globals).expect("globals");
        globals.current_region = Some(region.state);
        globals.update_state = UpdateState::CommitStarted;
        globals.elements = Some(array);
        globals.element_depth = u8::try_from(elements.len()).expect("at most 255 elements");
        array
    }

    /// Lays out a multi-region transaction with one sub-transaction per
    /// entry, linked in the given (file) order.
    ///
    /// Each entry names the descriptor the sub-transaction points at, which
    /// may be an alias.
    pub fn multi_region_commit(
        &mut self,
        parts: &[(Ptr<RegionDescriptor>, Vec<ElementSpec>)],
        update_state: UpdateState,
    ) -> Vec<Ptr<SubTransaction>> {
        let mut subs = Vec::with_capacity(parts.len());
        for (descriptor, specs) in parts {
            let ptrs: Vec<_> = specs.iter().map(|spec| self.element(spec)).collect();
            for pair in ptrs.windows(2) {
                self.mem.elements.get_mut(pair[0]).expect("element").next = Some(pair[1]);
            }
            let mut sub = SubTransaction::new(*descriptor);
            sub.first = ptrs.first().copied();
            sub.depth = ptrs.len() as u32;
            sub.update_state = update_state;
            subs.push(self.mem.subtransactions.alloc(sub));
        }
        for pair in subs.windows(2) {
            self.mem.subtransactions.get_mut(pair[0]).expect("sub").next_by_file = Some(pair[1]);
        }
        let globals = self.mem.globals.get_mut(self.globals).expect("globals");
        globals.tp_depth = 1;
        globals.first_by_file = subs.first().copied();
        subs
    }

    /// Adds a journal-pool region holding a ring of `capacity` bytes with
    /// `reserved` bytes reserved past the published address.
    pub fn journal_pool(&mut self, capacity: u32, write: u32, reserved: u32) -> (RegionHandles, Ptr<JournalPoolControl>) {
        let handles = self.alloc_region(RegionSpec::mapped().write_locked());
        let ring_base = self
            .mem
            .heap
            .map(u64::from(capacity), Protection::ReadWrite)
            .expect("ring");
        let control = self.mem.journal_pools.alloc(JournalPoolControl {
            ring_base,
            capacity,
            write,
            write_addr: 5000,
            early_write_addr: 5000 + u64::from(reserved),
            seqno: 1,
            last_write_len: 24,
        });
        self.mem.states.get_mut(handles.state).expect("state").journal_pool = Some(control);
        self.journal_pool = Some(handles.descriptor);
        (handles, control)
    }

    /// Finishes the image for a sweep invoked for `reason`.
    #[must_use]
    pub fn build(self, reason: CleanupReason) -> Scenario {
        let mut ctx = CleanupContext::new(self.process, reason)
            .globals(self.globals)
            .directories(self.directories);
        if let Some(pool) = self.journal_pool {
            ctx = ctx.journal_pool_region(pool);
        }
        Scenario { mem: self.mem, ctx }
    }
}
