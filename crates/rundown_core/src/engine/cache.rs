//! Cache slots of buffered regions.

use super::{Pass, Sweeper};
use crate::accounting::DiagSite;
use rundown_storage::{
    Access, BlockFormat, CacheState, CommitElement, CommitMode, SharedHeader, SharedMemory, Twin,
    BLOCK_EMPTY, NO_READ_IN_PROGRESS,
};

/// Victim scan position, shared by every element of one region so the
/// region never scans more than one full pass of the cache.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LruScan {
    cursor: Option<u32>,
    scanned: u32,
}

impl Sweeper<'_> {
    /// Validates the slot array and, for an exiting process, gives up its
    /// read latches and the slots it was reading into.
    ///
    /// Returns false if the array failed validation; the rest of the region
    /// is then skipped.
    pub(super) fn cache_exit_walk(&mut self, mem: &mut SharedMemory, pass: &mut Pass) -> bool {
        let probe = self.tools.probe;
        let Some(header) = self.header(mem, pass) else {
            return false;
        };
        let slots = header.cache_slots;
        let extent = CacheState::extent(slots);
        let valid = pass.view.shared_size != 0
            && mem
                .caches
                .probe_extent(pass.state.cache, extent, Access::Write, probe)
            && mem
                .caches
                .probe_read_extent(pass.state.cache, extent, probe)
                .is_some_and(|cache| cache.slots.len() >= slots as usize);
        if !valid {
            let addr = mem.caches.address_of(pass.state.cache);
            self.record(
                mem,
                pass,
                DiagSite::CacheArrayInvalid,
                &[pass.view.shared_size, addr, u64::from(slots)],
            );
            return false;
        }
        pass.cache_slots = Some(slots);

        let Some(cache) = mem.caches.probe_write_extent(pass.state.cache, extent, probe) else {
            return false;
        };
        let reaper = self.tools.reaper;
        let exiting = self.ctx.is_exiting();
        let pid = self.ctx.pid();
        let mut reaped = 0;
        if reaper.reap(&cache.queue_latch, exiting).released() {
            reaped += 1;
        }
        if exiting {
            for slot in cache.slots.iter_mut().take(slots as usize) {
                if reaper.reap(&slot.read_latch, exiting).released() {
                    reaped += 1;
                }
                // The read may still complete; ownership is left for whoever
                // waits on the slot.
                if slot.reader_pid == pid
                    && !slot.dirty
                    && !slot.in_transaction
                    && slot.block != BLOCK_EMPTY
                {
                    slot.cycle = slot.cycle.wrapping_add(1);
                    slot.block = BLOCK_EMPTY;
                }
            }
        }
        self.report.latches_reaped += reaped;
        true
    }

    /// Picks a slot for `cse`'s block and returns the address of its buffer.
    ///
    /// The slot is marked stopped so cache recovery finishes the write.
    pub(super) fn claim_victim(
        &mut self,
        mem: &mut SharedMemory,
        pass: &mut Pass,
        cse: &CommitElement,
        header: &SharedHeader,
    ) -> Option<u64> {
        let probe = self.tools.probe;
        let slots = pass.cache_slots?;
        let extent = CacheState::extent(slots);
        let mut cursor = match pass.lru.cursor {
            Some(cursor) => cursor,
            None => mem
                .nodes
                .probe_read(Some(pass.node), probe)
                .map_or(0, |node| node.lru_cursor),
        };
        let backup = mem
            .nodes
            .probe_read(Some(pass.node), probe)
            .is_some_and(|node| node.backup_in_progress);

        let mut victim = None;
        if let Some(cache) = mem.caches.probe_read_extent(pass.state.cache, extent, probe) {
            let block_size = u64::from(header.block_size);
            while pass.lru.scanned < slots {
                cursor = cursor.wrapping_add(1);
                if cursor >= slots {
                    cursor = 0;
                }
                pass.lru.scanned += 1;
                let Some(slot) = cache.slots.get(cursor as usize) else {
                    continue;
                };
                if !slot.stopped
                    && !slot.dirty
                    && !slot.in_transaction
                    && slot.read_in_progress == NO_READ_IN_PROGRESS
                    && mem.heap.probe(slot.buffer, block_size, Access::Write, probe)
                {
                    victim = Some(cursor);
                    break;
                }
            }
        }
        pass.lru.cursor = Some(cursor);
        let Some(index) = victim else {
            self.record(
                mem,
                pass,
                DiagSite::NoVictimSlot,
                &[u64::from(cse.block), u64::from(slots)],
            );
            self.write_header(mem, pass, |h| h.cache_blocked = true);
            return None;
        };

        let desired = header.desired_format;
        let claimed = mem
            .caches
            .probe_write_extent(pass.state.cache, extent, probe)
            .and_then(|cache| cache.slots.get_mut(index as usize))
            .map(|slot| {
                slot.cycle = slot.cycle.wrapping_add(1);
                slot.block = cse.block;
                slot.journal_addr = cse.journal_addr;
                slot.stopped = true;
                if let (true, Some(before)) = (backup, cse.before_image) {
                    slot.twin = Twin::BeforeImage(before);
                }
                let mut upgrade = 0_i64;
                if cse.mode == CommitMode::Acquired {
                    slot.ondisk_format = desired;
                    if desired == BlockFormat::Legacy {
                        upgrade = 1;
                    }
                } else if cse.ondisk_format != desired {
                    slot.ondisk_format = desired;
                    if cse.mode != CommitMode::WriteRecycled {
                        upgrade = if desired == BlockFormat::Legacy { 1 } else { -1 };
                    }
                } else {
                    slot.ondisk_format = cse.ondisk_format;
                }
                (slot.buffer, upgrade)
            });
        let Some((buffer, upgrade)) = claimed else {
            self.record(mem, pass, DiagSite::CacheSlotUnwritable, &[u64::from(index)]);
            return None;
        };
        if upgrade != 0 {
            self.write_header(mem, pass, |h| {
                h.blocks_to_upgrade = h.blocks_to_upgrade.wrapping_add(upgrade);
            });
        }
        Some(buffer)
    }

    /// Finishes the `in_commit` reset of a slot whose element was committed
    /// just before the writer died.
    pub(super) fn clear_in_commit(&mut self, mem: &mut SharedMemory, pass: &Pass, index: u32) {
        let probe = self.tools.probe;
        let Some(slots) = pass.cache_slots else {
            return;
        };
        let slot = mem
            .caches
            .probe_write_extent(pass.state.cache, CacheState::extent(slots), probe)
            .and_then(|cache| cache.slots.get_mut(index as usize).filter(|_| index < slots));
        match slot {
            Some(slot) => slot.in_commit = false,
            None => self.record(mem, pass, DiagSite::CacheSlotUnwritable, &[u64::from(index)]),
        }
    }
}
