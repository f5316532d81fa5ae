//! Replaying commit elements.

use super::chain::{self, BrokenChain};
use super::{Completeness, ElementList, Pass, Sweeper};
use crate::accounting::DiagSite;
use crate::builder::{BitmapInput, BuildInput};
use crate::resolve;
use rundown_storage::block::{self, BLOCK_HEADER_SIZE};
use rundown_storage::{
    Access, AccessMethod, CommitElement, CommitMode, ElementArray, HeapRange, Ptr, SharedHeader,
    SharedMemory,
};

/// A multi-region element; chain indices resolve from `first`.
#[derive(Debug, Clone, Copy)]
struct ChainPosition {
    first: Ptr<CommitElement>,
    depth: u32,
}

/// A single-region element at `index` of `array`.
#[derive(Debug, Clone, Copy)]
struct ArrayPosition {
    array: Ptr<ElementArray>,
    index: usize,
    depth: usize,
}

/// Where an element sits in its list.
#[derive(Debug, Clone, Copy)]
enum Position {
    Tp(ChainPosition),
    NonTp(ArrayPosition),
}

/// The page an element is written to.
#[derive(Debug, Clone, Copy)]
struct Page<'h> {
    header: &'h SharedHeader,
    addr: u64,
}

impl Page<'_> {
    fn len(&self) -> u64 {
        u64::from(self.header.block_size)
    }

    fn range(&self) -> HeapRange {
        HeapRange::new(self.addr, self.header.block_size)
    }
}

impl Sweeper<'_> {
    pub(super) fn replay(&mut self, mem: &mut SharedMemory, pass: &mut Pass, list: &ElementList) {
        if pass.state.commit_in_progress {
            let prev = pass.state.prev_free_blocks;
            self.write_header(mem, pass, |h| h.history.free_blocks = prev);
        }
        match *list {
            ElementList::Tp {
                first: Some(first),
                depth,
                ..
            } => {
                self.record(mem, pass, DiagSite::ReplayStart, &[1, u64::from(depth)]);
                self.replay_tp(mem, pass, first, depth);
            }
            ElementList::NonTp { array, depth } => {
                self.record(mem, pass, DiagSite::ReplayStart, &[0, depth as u64]);
                for index in 0..depth {
                    let Some(ptr) = self.array_element(mem, pass, array, index) else {
                        break;
                    };
                    let at = ArrayPosition { array, index, depth };
                    self.element(mem, pass, ptr, Position::NonTp(at));
                }
            }
            _ => {}
        }
    }

    /// Counts a kill the dead writer queued but had not yet counted.
    ///
    /// A region whose multi-region commit had already completed counted its
    /// own kill.
    pub(super) fn count_kill(&mut self, mem: &mut SharedMemory, pass: &Pass, list: &ElementList) {
        let probe = self.tools.probe;
        let counted = match *list {
            ElementList::Tp { sub, .. } => {
                if pass.completeness == Completeness::Complete {
                    return;
                }
                match mem.subtransactions.probe_write(Some(sub), probe) {
                    Some(sub) if sub.kill_set_present && !sub.kill_counted => {
                        sub.kill_counted = true;
                        true
                    }
                    Some(_) => false,
                    None => {
                        let addr = mem.subtransactions.address_of(Some(sub));
                        self.record(mem, pass, DiagSite::KillStateUnwritable, &[addr]);
                        false
                    }
                }
            }
            ElementList::NonTp { .. } => match mem.globals.probe_write(self.ctx.globals, probe) {
                Some(globals) if globals.kill_pending && !globals.kill_counted => {
                    globals.kill_counted = true;
                    globals.kill_pending = false;
                    self.globals = *globals;
                    true
                }
                Some(_) => false,
                None => {
                    let addr = mem.globals.address_of(self.ctx.globals);
                    self.record(mem, pass, DiagSite::KillStateUnwritable, &[addr]);
                    false
                }
            },
            ElementList::None => false,
        };
        if counted {
            self.write_header(mem, pass, |h| {
                h.kill_in_progress = h.kill_in_progress.wrapping_add(1);
            });
        }
    }

    /// Walks `next` links from `first`, replaying the deepest version of each
    /// element.
    fn replay_tp(&mut self, mem: &mut SharedMemory, pass: &mut Pass, first: Ptr<CommitElement>, depth: u32) {
        let probe = self.tools.probe;
        let mut cursor = Some(first);
        for _ in 0..=mem.elements.len() {
            let Some(raw) = cursor else {
                return;
            };
            let Some(next) = mem.elements.probe_read(Some(raw), probe).map(|e| e.next) else {
                let addr = mem.elements.address_of(Some(raw));
                self.record(mem, pass, DiagSite::ElementUnreadable, &[addr]);
                return;
            };
            let Some(ptr) = resolve::terminal(&mem.elements, raw, probe) else {
                let addr = mem.elements.address_of(Some(raw));
                self.record(mem, pass, DiagSite::NewerChainBroken, &[addr]);
                return;
            };
            self.element(mem, pass, ptr, Position::Tp(ChainPosition { first, depth }));
            cursor = next;
        }
    }

    fn array_element(
        &mut self,
        mem: &mut SharedMemory,
        pass: &Pass,
        array: Ptr<ElementArray>,
        index: usize,
    ) -> Option<Ptr<CommitElement>> {
        let ptr = mem
            .element_arrays
            .probe_read(Some(array), self.tools.probe)
            .and_then(|a| a.elements.get(index).copied());
        if ptr.is_none() {
            let addr = mem.element_arrays.address_of(Some(array));
            self.record(mem, pass, DiagSite::ElementArrayUnreadable, &[addr, index as u64]);
        }
        ptr
    }

    fn element(&mut self, mem: &mut SharedMemory, pass: &mut Pass, ptr: Ptr<CommitElement>, at: Position) {
        let probe = self.tools.probe;
        let Some(cse) = mem.elements.probe_read(Some(ptr), probe).copied() else {
            let addr = mem.elements.address_of(Some(ptr));
            self.record(mem, pass, DiagSite::ElementUnreadable, &[addr]);
            self.report.elements_skipped += 1;
            return;
        };
        if cse.mode.is_single_region_terminal() {
            // Nothing to build; the live writer would only flip the mode.
            self.commit(mem, pass, ptr);
            return;
        }
        if cse.mode == CommitMode::Committed {
            self.already_committed(mem, pass, &cse, at);
            return;
        }
        if matches!(at, Position::Tp(_)) {
            pass.completeness = pass.completeness.saw_uncommitted();
        }

        if !cse.mode.is_kill() {
            let Some(header) = self.header(mem, pass) else {
                self.report.elements_skipped += 1;
                return;
            };
            let Some(addr) = self.resolve_page(mem, pass, &cse, &header) else {
                self.report.elements_skipped += 1;
                return;
            };
            let page = Page { header: &header, addr };
            let written = match (cse.mode, at) {
                (CommitMode::WriteMap, _) => self.rebuild_bitmap(mem, pass, ptr, &cse, page),
                (_, Position::NonTp(at)) => self.write_block(mem, pass, &cse, page, at),
                (_, Position::Tp(at)) => self.write_tp_block(mem, pass, ptr, &cse, page, at),
            };
            if !written {
                self.report.elements_skipped += 1;
                return;
            }
        }

        // The bitmap builder may have rewritten the delta.
        let delta = mem
            .elements
            .probe_read(Some(ptr), probe)
            .map_or(cse.reference_delta, |e| e.reference_delta);
        let freed_legacy = delta < 0
            && self.globals.internal_op.is_bitmap_mark_free()
            && self.globals.internal_op_block != 0;
        self.write_header(mem, pass, |h| {
            if freed_legacy {
                h.blocks_to_upgrade = h.blocks_to_upgrade.wrapping_sub(1);
            }
            h.history.free_blocks = h.history.free_blocks.wrapping_sub(i64::from(delta));
        });
        self.commit(mem, pass, ptr);
    }

    fn commit(&mut self, mem: &mut SharedMemory, pass: &Pass, ptr: Ptr<CommitElement>) {
        match mem.elements.probe_write(Some(ptr), self.tools.probe) {
            Some(cse) => {
                cse.mark_committed();
                self.report.elements_replayed += 1;
            }
            None => {
                let addr = mem.elements.address_of(Some(ptr));
                self.record(mem, pass, DiagSite::ElementUnreadable, &[addr]);
                self.report.elements_skipped += 1;
            }
        }
    }

    /// An element the writer finished before dying.
    fn already_committed(&mut self, mem: &mut SharedMemory, pass: &mut Pass, cse: &CommitElement, at: Position) {
        if pass.state.commit_in_progress {
            let delta = i64::from(cse.reference_delta);
            self.write_header(mem, pass, |h| {
                h.history.free_blocks = h.history.free_blocks.wrapping_sub(delta);
            });
        }
        if matches!(at, Position::Tp(_)) {
            pass.completeness = pass.completeness.saw_committed();
        }
        if pass.buffered() && cse.prior_mode.is_some_and(CommitMode::writes_page) {
            if let Some(slot) = cse.cache_slot {
                self.clear_in_commit(mem, pass, slot);
            }
        }
    }

    fn resolve_page(
        &mut self,
        mem: &mut SharedMemory,
        pass: &mut Pass,
        cse: &CommitElement,
        header: &SharedHeader,
    ) -> Option<u64> {
        if pass.view.access_method == AccessMethod::Buffered {
            return self.claim_victim(mem, pass, cse, header);
        }
        let block_size = u64::from(header.block_size);
        let addr = block_size
            .checked_mul(u64::from(cse.block))
            .and_then(|offset| pass.state.mapped_base.checked_add(offset))
            .filter(|&addr| mem.heap.probe(addr, block_size, Access::Write, self.tools.probe));
        if addr.is_none() {
            self.record(
                mem,
                pass,
                DiagSite::PageUnwritable,
                &[u64::from(cse.block), pass.state.mapped_base, block_size],
            );
        }
        addr
    }

    /// Copies the before-image over the page and applies the block list.
    ///
    /// A failed rebuild is recorded but the element still counts as written.
    fn rebuild_bitmap(
        &mut self,
        mem: &mut SharedMemory,
        pass: &Pass,
        ptr: Ptr<CommitElement>,
        cse: &CommitElement,
        page: Page<'_>,
    ) -> bool {
        let probe = self.tools.probe;
        let copied = cse
            .before_image
            .is_some_and(|before| mem.heap.probe_copy(before, page.addr, page.len(), probe));
        if !copied {
            self.record(
                mem,
                pass,
                DiagSite::BeforeImageUnreadable,
                &[u64::from(cse.block), cse.before_image.unwrap_or(0)],
            );
            return false;
        }

        let bitmaps = self.tools.bitmaps;
        let mut delta = cse.reference_delta;
        let rebuilt = cse
            .update
            .and_then(|list| mem.heap.probe_split(list, page.range(), probe))
            .is_some_and(|(list, dst)| {
                let input = BitmapInput {
                    list,
                    commit_counter: page.header.history.current,
                    map_blocks: page.header.blocks_per_map,
                };
                bitmaps.rebuild(&input, dst, &mut delta)
            });
        if !rebuilt {
            let list = cse.update.map_or(0, |r| r.addr);
            self.record(
                mem,
                pass,
                DiagSite::BitmapBuildFailed,
                &[u64::from(cse.block), list, page.addr],
            );
            return true;
        }
        if let Some(element) = mem.elements.probe_write(Some(ptr), probe) {
            element.reference_delta = delta;
        }
        true
    }

    /// Runs the block builder over `cse`'s update records into `page`.
    fn build(&mut self, mem: &mut SharedMemory, pass: &Pass, cse: &CommitElement, page: Page<'_>) -> bool {
        let probe = self.tools.probe;
        let blocks = self.tools.blocks;
        let mut input = BuildInput {
            block: cse.block,
            level: cse.level,
            update: &[],
            commit_counter: page.header.history.current,
        };
        let built = match cse.update.filter(|range| range.len > 0) {
            Some(update) => mem
                .heap
                .probe_split(update, page.range(), probe)
                .map(|(src, dst)| {
                    input.update = src;
                    blocks.build(&input, dst)
                }),
            None => mem
                .heap
                .probe_write(page.addr, page.len(), probe)
                .map(|dst| blocks.build(&input, dst)),
        };
        match built {
            Some(true) => true,
            Some(false) => {
                self.record(
                    mem,
                    pass,
                    DiagSite::BlockBuildFailed,
                    &[u64::from(cse.block), u64::from(cse.level), page.addr],
                );
                false
            }
            None => {
                let update = cse.update.map_or(0, |r| r.addr);
                self.record(
                    mem,
                    pass,
                    DiagSite::PageUnwritable,
                    &[u64::from(cse.block), page.addr, update],
                );
                false
            }
        }
    }

    /// Used size of a built page, bounded by the block size.
    fn built_size(&self, mem: &SharedMemory, page: Page<'_>) -> Option<u32> {
        mem.heap
            .probe_read(page.addr, page.len(), self.tools.probe)
            .map(|bytes| block::used_size(bytes).min(page.header.block_size))
    }

    /// Single-region page: build, then resolve the insertion slot from an
    /// earlier element of the array (and that of a following root write).
    fn write_block(
        &mut self,
        mem: &mut SharedMemory,
        pass: &Pass,
        cse: &CommitElement,
        page: Page<'_>,
        at: ArrayPosition,
    ) -> bool {
        let ArrayPosition { array, index, depth } = at;
        if !self.build(mem, pass, cse, page) {
            return false;
        }
        if cse.ins_off == 0 {
            return true;
        }
        let used = self.built_size(mem, page).unwrap_or(0);
        if !chain::insertion_in_bounds(cse.ins_off, used) || !chain::index_precedes(cse.index, index) {
            self.record(
                mem,
                pass,
                DiagSite::InsertOffsetInvalid,
                &[u64::from(cse.block), cse.index as u64, u64::from(cse.ins_off), u64::from(used)],
            );
            return false;
        }
        if !self.insert_block_number(mem, pass, page, array, cse.ins_off, cse.index) {
            return false;
        }

        if index + 1 >= depth {
            return true;
        }
        let root = self
            .array_element(mem, pass, array, index + 1)
            .and_then(|next| mem.elements.probe_read(Some(next), self.tools.probe).copied())
            .filter(|next| next.mode == CommitMode::WriteRoot);
        let Some(root) = root else {
            return true;
        };
        if !chain::insertion_in_bounds(root.ins_off, used) || !chain::index_precedes(root.index, index) {
            self.record(
                mem,
                pass,
                DiagSite::RootInsertInvalid,
                &[u64::from(cse.block), root.index as u64, u64::from(root.ins_off), u64::from(used)],
            );
            return false;
        }
        self.insert_block_number(mem, pass, page, array, root.ins_off, root.index)
    }

    /// Writes the block number of `array[target]` at `page + off`.
    fn insert_block_number(
        &mut self,
        mem: &mut SharedMemory,
        pass: &Pass,
        page: Page<'_>,
        array: Ptr<ElementArray>,
        off: u32,
        target: i32,
    ) -> bool {
        let probe = self.tools.probe;
        let Some(target) = usize::try_from(target)
            .ok()
            .and_then(|t| self.array_element(mem, pass, array, t))
        else {
            return false;
        };
        let Some(block_number) = mem.elements.probe_read(Some(target), probe).map(|e| e.block) else {
            let addr = mem.elements.address_of(Some(target));
            self.record(mem, pass, DiagSite::ElementUnreadable, &[addr]);
            return false;
        };
        let written = mem
            .heap
            .probe_write(page.addr, page.len(), probe)
            .is_some_and(|bytes| block::write_word(bytes, off, block_number));
        if !written {
            self.record(mem, pass, DiagSite::PageUnwritable, &[u64::from(block_number), page.addr]);
        }
        written
    }

    /// Multi-region page: build it (or copy the image the writer already
    /// built), seed the fixup chain, then resolve the chain.
    fn write_tp_block(
        &mut self,
        mem: &mut SharedMemory,
        pass: &Pass,
        ptr: Ptr<CommitElement>,
        cse: &CommitElement,
        page: Page<'_>,
        at: ChainPosition,
    ) -> bool {
        let probe = self.tools.probe;
        let ChainPosition { first, depth } = at;
        let mut first_off = cse.first_off;
        if !cse.done {
            if !self.build(mem, pass, cse, page) {
                return false;
            }
            if cse.ins_off != 0 {
                let used = self.built_size(mem, page).unwrap_or(0);
                if !chain::insertion_in_bounds(cse.ins_off, used) {
                    self.record(
                        mem,
                        pass,
                        DiagSite::InsertOffsetInvalid,
                        &[u64::from(cse.block), cse.index as u64, u64::from(cse.ins_off), u64::from(used)],
                    );
                    return false;
                }
                if first_off == 0 {
                    first_off = cse.ins_off;
                }
                let link = block::ChainLink {
                    flag: true,
                    index: u16::try_from(cse.index).unwrap_or(block::ChainLink::MAX_INDEX),
                    next_off: u16::try_from(cse.next_off).unwrap_or(0),
                };
                let written = mem
                    .heap
                    .probe_write(page.addr, page.len(), probe)
                    .is_some_and(|bytes| block::write_word(bytes, cse.ins_off, link.encode()));
                if !written {
                    self.record(mem, pass, DiagSite::PageUnwritable, &[u64::from(cse.block), page.addr]);
                    return false;
                }
                match mem.elements.probe_write(Some(ptr), probe) {
                    Some(element) => {
                        element.first_off = first_off;
                        element.ins_off = 0;
                        element.next_off = 0;
                    }
                    None => {
                        let addr = mem.elements.address_of(Some(ptr));
                        self.record(mem, pass, DiagSite::ElementUnreadable, &[addr]);
                    }
                }
            }
        } else if !self.copy_built_image(mem, pass, cse, page) {
            return false;
        }

        if first_off != 0 {
            let elements = &mem.elements;
            let resolved = mem
                .heap
                .probe_write(page.addr, page.len(), probe)
                .map(|bytes| {
                    chain::resolve_links(bytes, first_off, depth, |index| {
                        resolve::nth(elements, first, u32::from(index), probe)
                            .and_then(|target| elements.probe_read(Some(target), probe))
                            .map(|target| target.block)
                    })
                });
            match resolved {
                Some(Ok(links)) => {
                    tracing::trace!(block = cse.block, links, "fixup chain resolved");
                }
                Some(Err(BrokenChain { offset, word })) => self.record(
                    mem,
                    pass,
                    DiagSite::FixupChainBroken,
                    &[u64::from(cse.block), u64::from(offset), u64::from(word), u64::from(depth)],
                ),
                None => self.record(mem, pass, DiagSite::PageUnwritable, &[u64::from(cse.block), page.addr]),
            }
        }
        true
    }

    /// Copies the image the writer finished building and stamps the commit
    /// counter.
    fn copy_built_image(
        &mut self,
        mem: &mut SharedMemory,
        pass: &Pass,
        cse: &CommitElement,
        page: Page<'_>,
    ) -> bool {
        let probe = self.tools.probe;
        let size = cse.new_image.and_then(|image| {
            mem.heap
                .probe_read(image, u64::from(BLOCK_HEADER_SIZE), probe)
                .map(|bytes| block::used_size(bytes).min(page.header.block_size))
        });
        let counter = page.header.history.current;
        let copied = match (cse.new_image, size) {
            (Some(image), Some(size)) if size >= BLOCK_HEADER_SIZE => {
                mem.heap.probe_copy(image, page.addr, u64::from(size), probe)
                    && mem
                        .heap
                        .probe_write(page.addr, u64::from(BLOCK_HEADER_SIZE), probe)
                        .is_some_and(|bytes| block::set_commit_counter(bytes, counter))
            }
            _ => false,
        };
        if !copied {
            self.record(
                mem,
                pass,
                DiagSite::BlockBuildFailed,
                &[u64::from(cse.block), cse.new_image.unwrap_or(0), page.addr],
            );
        }
        copied
    }
}
