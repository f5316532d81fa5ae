//! The per-region roll-forward sweep.
//!
//! [`Rundown::run`] classifies the invoking process once, then visits every
//! region of every directory in order. For each region it re-validates the
//! descriptor chain, releases what an exiting process held in the node-local
//! and cache areas, replays the commit elements the dead writer left
//! behind, and finally releases the region lock and any latches whose owner
//! is gone. The journal-pool tail is completed last.
//!
//! Every shared structure is re-probed at the moment it is touched. A failed
//! probe is recorded and the object is abandoned; the sweep itself only
//! fails on an invariant violation under [`InvariantPolicy::Abort`].

mod cache;
mod chain;
mod release;
mod replay;

use crate::accounting::{DiagSite, Diagnostics};
use crate::builder::{BitmapBuilder, BlockBuilder, LocalMapBuilder, RecordBlockBuilder};
use crate::classify::{classify, CommitUnderway};
use crate::config::{Config, InvariantPolicy};
use crate::context::CleanupContext;
use crate::error::{CoreError, CoreResult};
use crate::latch::{LatchReaper, LivenessOracle};
use crate::lock::{CritLock, RegionLock};
use crate::report::RundownReport;
use crate::resolve::{self, RegionView, Skip};
use rundown_storage::{
    Access, AccessMethod, CommitElement, ElementArray, MemoryProbe, NodeLocal, Ptr,
    RegionDescriptor, RegionState, Severity, SharedHeader, SharedMemory, SubTransaction,
    TransactionGlobals,
};
use std::fmt;

use self::cache::LruScan;

/// Progress of one region through the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RegionPhase {
    Unstarted,
    BuildingBlocks,
    BlocksDone,
    LockReleased,
}

/// How far the dead writer got through a multi-region commit in one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completeness {
    Unstarted,
    Partial,
    Complete,
}

impl Completeness {
    /// A committed element was seen. Never downgrades a partial commit.
    const fn saw_committed(self) -> Self {
        match self {
            Self::Unstarted => Self::Complete,
            other => other,
        }
    }

    /// An uncommitted element was seen.
    const fn saw_uncommitted(self) -> Self {
        match self {
            Self::Complete => Self::Partial,
            other => other,
        }
    }
}

/// Elements to replay in one region.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ElementList {
    None,
    Tp {
        sub: Ptr<SubTransaction>,
        first: Option<Ptr<CommitElement>>,
        depth: u32,
    },
    NonTp {
        array: Ptr<ElementArray>,
        depth: usize,
    },
}

impl ElementList {
    const fn has_elements(&self) -> bool {
        match self {
            Self::None => false,
            Self::Tp { first, .. } => first.is_some(),
            Self::NonTp { depth, .. } => *depth > 0,
        }
    }
}

/// State carried through one region.
#[derive(Debug, Clone)]
pub(crate) struct Pass {
    view: RegionView,
    /// Last known copy of the region state; refreshed on every write.
    state: RegionState,
    header: Ptr<SharedHeader>,
    node: Ptr<NodeLocal>,
    accounting: bool,
    phase: RegionPhase,
    completeness: Completeness,
    /// Slot count validated by the cache exit walk.
    cache_slots: Option<u32>,
    lru: LruScan,
}

impl Pass {
    fn buffered(&self) -> bool {
        self.view.access_method == AccessMethod::Buffered
    }
}

#[derive(Clone, Copy)]
struct Tools<'a> {
    probe: &'a dyn MemoryProbe,
    blocks: &'a dyn BlockBuilder,
    bitmaps: &'a dyn BitmapBuilder,
    lock: &'a dyn RegionLock,
    reaper: LatchReaper<'a>,
}

/// The sweep over one invocation's memory image.
struct Sweeper<'a> {
    tools: Tools<'a>,
    config: Config,
    ctx: &'a CleanupContext,
    underway: CommitUnderway,
    globals: TransactionGlobals,
    diag: Diagnostics,
    report: RundownReport,
}

/// Completes or abandons the commits of a process that is going away.
///
/// Collaborators default to [`RecordBlockBuilder`], [`LocalMapBuilder`] and
/// [`CritLock`] and can be replaced with the `with_*` methods.
///
/// ```rust
/// use rundown_core::{CleanupContext, CleanupReason, Config, LivenessOracle, Rundown};
/// use rundown_storage::{LatchOwner, MappingProbe, SharedMemory};
///
/// struct NobodyDies;
/// impl LivenessOracle for NobodyDies {
///     fn is_alive(&self, _pid: u32, _generation: u32) -> bool {
///         true
///     }
/// }
///
/// let mut mem = SharedMemory::new();
/// let ctx = CleanupContext::new(LatchOwner::new(42, 1), CleanupReason::NormalTermination);
/// let mut rundown = Rundown::new(Config::default(), &MappingProbe, &NobodyDies);
/// let report = rundown.run(&mut mem, &ctx).unwrap();
/// assert!(report.is_noop());
/// ```
pub struct Rundown<'a> {
    config: Config,
    probe: &'a dyn MemoryProbe,
    oracle: &'a dyn LivenessOracle,
    blocks: &'a dyn BlockBuilder,
    bitmaps: &'a dyn BitmapBuilder,
    lock: &'a dyn RegionLock,
    diagnostics: Diagnostics,
}

impl fmt::Debug for Rundown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rundown")
            .field("config", &self.config)
            .field("diagnostics", &self.diagnostics)
            .finish_non_exhaustive()
    }
}

impl<'a> Rundown<'a> {
    /// Creates a sweep using the reference builders and lock.
    #[must_use]
    pub fn new(config: Config, probe: &'a dyn MemoryProbe, oracle: &'a dyn LivenessOracle) -> Self {
        Self {
            diagnostics: Diagnostics::with_capacity(config.trace_capacity),
            config,
            probe,
            oracle,
            blocks: &RecordBlockBuilder,
            bitmaps: &LocalMapBuilder,
            lock: &CritLock,
        }
    }

    /// Replaces the block builder.
    #[must_use]
    pub fn with_block_builder(mut self, blocks: &'a dyn BlockBuilder) -> Self {
        self.blocks = blocks;
        self
    }

    /// Replaces the bitmap builder.
    #[must_use]
    pub fn with_bitmap_builder(mut self, bitmaps: &'a dyn BitmapBuilder) -> Self {
        self.bitmaps = bitmaps;
        self
    }

    /// Replaces the region lock.
    #[must_use]
    pub fn with_region_lock(mut self, lock: &'a dyn RegionLock) -> Self {
        self.lock = lock;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the process-level diagnostics of the last run.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Runs the sweep for the process described by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvariantViolation`](crate::CoreError::InvariantViolation)
    /// when a consistency check fails under [`InvariantPolicy::Abort`].
    /// Everything the sweep did before the failed check stays done.
    pub fn run(&mut self, mem: &mut SharedMemory, ctx: &CleanupContext) -> CoreResult<RundownReport> {
        let mut diag = std::mem::take(&mut self.diagnostics);
        diag.reset();
        let underway = match classify(mem, ctx, self.probe, self.config.invariant_policy, &mut diag)
        {
            Ok(underway) => underway,
            Err(err) => {
                self.diagnostics = diag;
                return Err(err);
            }
        };
        let globals = mem
            .globals
            .probe_read(ctx.globals, self.probe)
            .copied()
            .unwrap_or_default();

        let mut sweeper = Sweeper {
            tools: Tools {
                probe: self.probe,
                blocks: self.blocks,
                bitmaps: self.bitmaps,
                lock: self.lock,
                reaper: LatchReaper::new(
                    self.oracle,
                    ctx.process,
                    self.config.generation_aware_liveness,
                ),
            },
            config: self.config,
            ctx,
            underway,
            globals,
            diag,
            report: RundownReport::new(ctx.reason),
        };
        tracing::debug!(pid = ctx.pid(), reason = %ctx.reason, "rundown started");
        let result = sweeper.execute(mem);
        let Sweeper {
            diag,
            mut report,
            underway,
            ..
        } = sweeper;
        report.underway = underway;
        report.diagnostics = diag.recorded();
        self.diagnostics = diag;
        result?;

        tracing::info!(
            pid = ctx.pid(),
            reason = %ctx.reason,
            visited = report.regions_visited,
            rolled_forward = report.regions_rolled_forward,
            replayed = report.elements_replayed,
            locks_released = report.locks_released,
            diagnostics = report.diagnostics,
            "rundown complete"
        );
        Ok(report)
    }
}

impl Sweeper<'_> {
    fn execute(&mut self, mem: &mut SharedMemory) -> CoreResult<()> {
        let probe = self.tools.probe;
        let directory_count = match mem.directory_lists.probe_read(self.ctx.directories, probe) {
            Some(list) => list.directories.len(),
            None => {
                if self.ctx.directories.is_some() {
                    self.diag.record(DiagSite::DirectoryUnreadable, &[]);
                }
                0
            }
        };
        'directories: for d in 0..directory_count {
            let directory = mem
                .directory_lists
                .probe_read(self.ctx.directories, probe)
                .and_then(|list| list.directories.get(d).copied());
            let Some(directory) = directory else {
                self.diag.record(DiagSite::DirectoryUnreadable, &[d as u64]);
                break;
            };
            let Some(region_count) = mem
                .directories
                .probe_read(Some(directory), probe)
                .map(|dir| dir.regions.len())
            else {
                let addr = mem.directories.address_of(Some(directory));
                self.diag.record(DiagSite::DirectoryUnreadable, &[addr]);
                break;
            };
            for r in 0..region_count {
                let descriptor = mem
                    .directories
                    .probe_read(Some(directory), probe)
                    .and_then(|dir| dir.regions.get(r).copied());
                let Some(descriptor) = descriptor else {
                    let addr = mem.directories.address_of(Some(directory));
                    self.diag.record(DiagSite::DirectoryUnreadable, &[addr, r as u64]);
                    break 'directories;
                };
                self.region(mem, descriptor)?;
            }
        }
        self.journal_pool(mem);
        Ok(())
    }

    fn region(&mut self, mem: &mut SharedMemory, descriptor: Ptr<RegionDescriptor>) -> CoreResult<()> {
        let probe = self.tools.probe;
        let view = match resolve::region(mem, Some(descriptor), probe) {
            Ok(view) => view,
            Err(Skip::Unreadable(site)) => {
                self.diag.record(site, &[mem.regions.address_of(Some(descriptor))]);
                self.report.regions_skipped += 1;
                return Ok(());
            }
            Err(skip) => {
                tracing::debug!(region = descriptor.index(), ?skip, "region skipped");
                self.report.regions_skipped += 1;
                return Ok(());
            }
        };
        let Some(state) = mem.states.probe_read(Some(view.state), probe).copied() else {
            self.diag.record(DiagSite::RegionStateUnwritable, &[]);
            self.report.regions_skipped += 1;
            return Ok(());
        };
        let header_len = std::mem::size_of::<SharedHeader>() as u64;
        let Some(header) = state
            .header
            .filter(|&h| mem.headers.probe_extent(Some(h), header_len, Access::Write, probe))
        else {
            let addr = mem.headers.address_of(state.header);
            self.diag.record(DiagSite::HeaderUnwritable, &[addr]);
            self.report.regions_skipped += 1;
            return Ok(());
        };
        let node_len = std::mem::size_of::<NodeLocal>() as u64;
        let Some(node) = state
            .node
            .filter(|&n| mem.nodes.probe_extent(Some(n), node_len, Access::Write, probe))
        else {
            let addr = mem.nodes.address_of(state.node);
            self.diag.record(DiagSite::NodeLocalUnwritable, &[addr]);
            self.report.regions_skipped += 1;
            return Ok(());
        };
        self.report.regions_visited += 1;

        let mut pass = Pass {
            view,
            state,
            header,
            node,
            accounting: self.config.accounting
                && state.holds_write_lock
                && (state.read_write || view.access_method == AccessMethod::Buffered),
            phase: RegionPhase::Unstarted,
            completeness: Completeness::Unstarted,
            cache_slots: None,
            lru: LruScan::default(),
        };
        if pass.accounting {
            if let Some(node) = mem.nodes.probe_write(Some(node), probe) {
                node.accounting.reset();
            }
        }
        let current = self.header(mem, &pass).map_or(0, |h| h.history.current);
        self.record(
            mem,
            &pass,
            DiagSite::Invocation,
            &[u64::from(self.ctx.pid()), self.ctx.reason.code()],
        );
        self.record(mem, &pass, DiagSite::CommitCounter, &[current]);

        if self.ctx.is_exiting() {
            self.release_node_local(mem, &mut pass);
        }
        if pass.buffered() && !self.cache_exit_walk(mem, &mut pass) {
            return Ok(());
        }

        let list = self.element_list(mem, &mut pass)?;
        if pass.state.holds_write_lock && list.has_elements() {
            pass.phase = RegionPhase::BuildingBlocks;
            self.replay(mem, &mut pass, &list);
            pass.phase = RegionPhase::BlocksDone;
            self.count_kill(mem, &pass, &list);
            self.report.regions_rolled_forward += 1;
        }

        if self.ctx.is_exiting() {
            if self.header(mem, &pass).is_some_and(|h| h.journal_enabled) {
                self.release_journal(mem, &pass);
            }
            self.release_freeze(mem, &pass);
        }
        self.mark_cache_blocked(mem, &mut pass);
        self.release_lock(mem, &mut pass)?;
        if self.ctx.is_exiting() {
            self.release_pool(mem, &pass);
        }
        self.reap_crit_latches(mem, &pass);
        tracing::debug!(
            region = descriptor.index(),
            phase = ?pass.phase,
            completeness = ?pass.completeness,
            "region done"
        );
        Ok(())
    }

    fn element_list(&mut self, mem: &mut SharedMemory, pass: &mut Pass) -> CoreResult<ElementList> {
        if self.underway.tp {
            return Ok(self.find_sub_transaction(mem, pass));
        }
        if self.globals.tp_depth > 0 || !pass.state.commit_in_progress {
            return Ok(ElementList::None);
        }
        if !pass.state.holds_write_lock {
            self.check(
                mem,
                pass,
                DiagSite::CommitWithoutLock,
                "region in commit without its write lock",
            )?;
        }
        if !self.underway.non_tp {
            self.check(
                mem,
                pass,
                DiagSite::UnexpectedCommitRegion,
                "region in commit was not the current region",
            )?;
            self.underway.non_tp = true;
        }
        let depth = usize::from(self.globals.element_depth);
        if depth == 0 {
            // A duplicate update: nothing to build.
            return Ok(ElementList::None);
        }
        let probe = self.tools.probe;
        match self
            .globals
            .elements
            .filter(|&a| mem.element_arrays.probe_read(Some(a), probe).is_some())
        {
            Some(array) => Ok(ElementList::NonTp { array, depth }),
            None => {
                let addr = mem.element_arrays.address_of(self.globals.elements);
                self.record(mem, pass, DiagSite::ElementArrayUnreadable, &[addr]);
                Ok(ElementList::None)
            }
        }
    }

    /// Finds the sub-transaction whose region maps the same file as `pass`.
    ///
    /// Matching is by file control, not by descriptor, because several
    /// directories may name the same file and only one descriptor of the set
    /// is processed.
    fn find_sub_transaction(&mut self, mem: &mut SharedMemory, pass: &Pass) -> ElementList {
        let probe = self.tools.probe;
        let mut cursor = self.globals.first_by_file;
        for _ in 0..=mem.subtransactions.len() {
            let Some(ptr) = cursor else {
                break;
            };
            let Some(sub) = mem.subtransactions.probe_read(Some(ptr), probe).copied() else {
                let addr = mem.subtransactions.address_of(Some(ptr));
                self.record(mem, pass, DiagSite::SubTransactionUnreadable, &[addr]);
                break;
            };
            match resolve::file_of(mem, sub.region, probe) {
                Ok(file) if file == Some(pass.view.file) => {
                    let first = match sub.first {
                        Some(first) if resolve::terminal(&mem.elements, first, probe).is_none() => {
                            let addr = mem.elements.address_of(Some(first));
                            self.record(mem, pass, DiagSite::NewerChainBroken, &[addr]);
                            None
                        }
                        first => first,
                    };
                    return ElementList::Tp {
                        sub: ptr,
                        first,
                        depth: sub.depth,
                    };
                }
                Ok(_) => {}
                Err(site) => {
                    let addr = mem.regions.address_of(sub.region);
                    self.record(mem, pass, site, &[addr]);
                }
            }
            cursor = sub.next_by_file;
        }
        ElementList::None
    }

    /// Records `site` into the region's trace table when accounting is on
    /// for it, else into the process-level table.
    ///
    /// Informational entries of a region without accounting are only logged.
    fn record(&mut self, mem: &mut SharedMemory, pass: &Pass, site: DiagSite, words: &[u64]) {
        if pass.accounting {
            if let Some(node) = mem.nodes.probe_write(Some(pass.node), self.tools.probe) {
                node.accounting.append(site.severity(), site.code(), words);
                self.diag.note(site, words);
                return;
            }
        }
        if site.severity() >= Severity::Warning {
            self.diag.record(site, words);
        } else {
            self.diag.note(site, words);
        }
    }

    fn check(
        &mut self,
        mem: &mut SharedMemory,
        pass: &Pass,
        site: DiagSite,
        detail: &'static str,
    ) -> CoreResult<()> {
        self.record(mem, pass, site, &[]);
        match self.config.invariant_policy {
            InvariantPolicy::Abort => Err(CoreError::invariant_violation(site, detail)),
            InvariantPolicy::Record => Ok(()),
        }
    }

    fn header(&mut self, mem: &mut SharedMemory, pass: &Pass) -> Option<SharedHeader> {
        match mem.headers.probe_read(Some(pass.header), self.tools.probe) {
            Some(header) => Some(*header),
            None => {
                self.record(mem, pass, DiagSite::HeaderUnwritable, &[]);
                None
            }
        }
    }

    fn write_header<R>(
        &mut self,
        mem: &mut SharedMemory,
        pass: &Pass,
        f: impl FnOnce(&mut SharedHeader) -> R,
    ) -> Option<R> {
        match mem.headers.probe_write(Some(pass.header), self.tools.probe) {
            Some(header) => Some(f(header)),
            None => {
                self.record(mem, pass, DiagSite::HeaderUnwritable, &[]);
                None
            }
        }
    }

    fn write_node<R>(
        &mut self,
        mem: &mut SharedMemory,
        pass: &Pass,
        f: impl FnOnce(&mut NodeLocal) -> R,
    ) -> Option<R> {
        match mem.nodes.probe_write(Some(pass.node), self.tools.probe) {
            Some(node) => Some(f(node)),
            None => {
                self.record(mem, pass, DiagSite::NodeLocalUnwritable, &[]);
                None
            }
        }
    }

    /// Writes the region state and refreshes the pass's copy.
    fn write_state<R>(
        &mut self,
        mem: &mut SharedMemory,
        pass: &mut Pass,
        f: impl FnOnce(&mut RegionState) -> R,
    ) -> Option<R> {
        match mem.states.probe_write(Some(pass.view.state), self.tools.probe) {
            Some(state) => {
                let out = f(state);
                pass.state = *state;
                Some(out)
            }
            None => {
                self.record(mem, pass, DiagSite::RegionStateUnwritable, &[]);
                None
            }
        }
    }
}
