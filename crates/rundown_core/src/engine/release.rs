//! Releasing what the invoking process held in a region.

use super::{Pass, RegionPhase, Sweeper};
use crate::accounting::DiagSite;
use crate::context::CleanupReason;
use crate::error::CoreResult;
use crate::jnlpool::{self, Tail};
use crate::resolve::{self, Skip};
use rundown_storage::{CritSection, JournalBuffer, ShmPool, SharedMemory};

impl Sweeper<'_> {
    /// Backs out the exiting process's node-local bookkeeping.
    pub(super) fn release_node_local(&mut self, mem: &mut SharedMemory, pass: &mut Pass) {
        let reaper = self.tools.reaper;
        let pid = self.ctx.pid();
        let abnormal = self.ctx.reason == CleanupReason::AbnormalTermination;
        let state = pass.state;
        let mut reaped = false;
        let mut drop_attach = false;
        let updated = self.write_node(mem, pass, |node| {
            reaped = reaper.reap(&node.cache_var_latch, true).released();
            if abnormal {
                if state.timer_pending && node.flush_timers > -1 {
                    node.flush_timers -= 1;
                }
                if state.read_write && state.attach_refs > 0 {
                    node.attach_count = node.attach_count.saturating_sub(1);
                    drop_attach = true;
                }
            }
            if state.in_write_start && node.writers_active > 0 {
                node.writers_active -= 1;
            }
            if node.flush_owner == pid {
                node.flush_owner = 0;
            }
        });
        if updated.is_none() {
            return;
        }
        if reaped {
            self.report.latches_reaped += 1;
        }
        self.write_state(mem, pass, |state| {
            if abnormal {
                state.timer_pending = false;
            }
            if drop_attach {
                state.attach_refs -= 1;
            }
            state.in_write_start = false;
        });
    }

    /// Publishes journal pointers the exiting process had staged and drops
    /// its claims on the journal buffer.
    pub(super) fn release_journal(&mut self, mem: &mut SharedMemory, pass: &Pass) {
        let probe = self.tools.probe;
        let Some(private) = mem.journals.probe_read(pass.state.journal, probe).copied() else {
            let addr = mem.journals.address_of(pass.state.journal);
            self.record(mem, pass, DiagSite::JournalUnreadable, &[addr]);
            return;
        };
        let Some(buffer) = mem.journal_buffers.probe_write(private.buffer, probe) else {
            let addr = mem.journal_buffers.address_of(private.buffer);
            self.record(mem, pass, DiagSite::JournalUnreadable, &[addr]);
            return;
        };
        let reaper = self.tools.reaper;
        let pid = self.ctx.pid();
        let mut reaped = 0;
        if reaper.reap(&buffer.fsync_latch, true).released() {
            reaped += 1;
        }
        if buffer.io_latch.owner_pid() == pid {
            if private.disk_update_pending {
                buffer.disk_offset = private.new_disk_offset;
                buffer.disk_addr = private.new_disk_addr;
            }
            buffer.io_latch.force_release();
            reaped += 1;
        }
        let JournalBuffer {
            free_offset,
            free_addr,
            free_update_pid,
            blocked_pid,
            ..
        } = buffer;
        if *free_update_pid == pid {
            *free_offset = private.pending_free_offset;
            *free_addr = private.pending_free_addr;
            *free_update_pid = 0;
        }
        if *blocked_pid == pid {
            *blocked_pid = 0;
        }
        self.report.latches_reaped += reaped;
    }

    /// Lifts a non-persistent freeze the exiting process still owns.
    pub(super) fn release_freeze(&mut self, mem: &mut SharedMemory, pass: &Pass) {
        if !pass.state.freeze_held || pass.state.persistent_freeze {
            return;
        }
        let pid = self.ctx.pid();
        self.write_header(mem, pass, |h| {
            if h.freeze_owner == pid {
                h.freeze_owner = 0;
                h.freeze_generation = 0;
            }
        });
    }

    /// Flags the cache for rebuild when the process died holding the write
    /// lock or a dequeued write buffer.
    pub(super) fn mark_cache_blocked(&mut self, mem: &mut SharedMemory, pass: &mut Pass) {
        let state = pass.state;
        if pass.buffered() && (state.write_dequeued || state.holds_write_lock) {
            let current = self.write_header(mem, pass, |h| {
                h.cache_blocked = true;
                h.history.current
            });
            self.write_node(mem, pass, |node| {
                if state.holds_write_lock {
                    node.blocked_by_holder = node.blocked_by_holder.wrapping_add(1);
                } else {
                    node.blocked_by_dequeue = node.blocked_by_dequeue.wrapping_add(1);
                }
            });
            self.record(
                mem,
                pass,
                DiagSite::CacheBlocked,
                &[u64::from(self.ctx.pid()), current.unwrap_or(0)],
            );
            self.report.cache_blocked += 1;
        }
        if state.write_dequeued {
            self.write_state(mem, pass, |s| s.write_dequeued = false);
        }
    }

    /// Settles the commit counters and releases the region lock.
    pub(super) fn release_lock(&mut self, mem: &mut SharedMemory, pass: &mut Pass) -> CoreResult<()> {
        let probe = self.tools.probe;
        let pid = self.ctx.pid();
        if pass.state.holds_write_lock {
            let gap = self.header(mem, pass).is_some_and(|h| h.history.has_gap());
            if gap {
                if self.ctx.reason == CleanupReason::NormalTermination {
                    self.check(
                        mem,
                        pass,
                        DiagSite::UnderwayAtNormalExit,
                        "commit counter gap at normal exit",
                    )?;
                }
                let roll_forward = self.underway.any();
                self.write_header(mem, pass, |h| {
                    if roll_forward {
                        h.history.current = h.history.next;
                    } else {
                        h.history.next = h.history.current;
                    }
                });
            }
            self.write_state(mem, pass, |s| s.commit_in_progress = false);

            let writable = mem.nodes.probe_write(Some(pass.node), probe).is_some()
                && mem.crits.probe_write(pass.state.crit, probe).is_some();
            if !writable {
                let addr = mem.crits.address_of(pass.state.crit);
                self.record(mem, pass, DiagSite::LockStateUnwritable, &[addr]);
            } else {
                self.write_node(mem, pass, |node| {
                    if node.write_lock_owner == pid {
                        node.write_lock_owner = 0;
                    }
                });
                let lock = self.tools.lock;
                let released = mem
                    .crits
                    .probe_read(pass.state.crit, probe)
                    .is_some_and(|crit| lock.unlock_write(crit, pid, crit.crash_count));
                if released {
                    self.report.locks_released += 1;
                } else {
                    let addr = mem.crits.address_of(pass.state.crit);
                    self.record(mem, pass, DiagSite::LockReleaseFailed, &[addr, u64::from(pid)]);
                }
                self.write_state(mem, pass, |s| s.holds_write_lock = false);
                pass.phase = RegionPhase::LockReleased;
            }

            let mismatch = self
                .header(mem, pass)
                .is_some_and(|h| h.history.next != h.history.current);
            if mismatch {
                self.check(
                    mem,
                    pass,
                    DiagSite::CounterMismatch,
                    "commit counters differ after lock release",
                )?;
            }
        } else if pass.state.holds_read_lock {
            let lock = self.tools.lock;
            match mem.crits.probe_write(pass.state.crit, probe) {
                Some(crit) => {
                    if lock.unlock_read(crit) {
                        self.report.locks_released += 1;
                    }
                }
                None => {
                    let addr = mem.crits.address_of(pass.state.crit);
                    self.record(mem, pass, DiagSite::LockStateUnwritable, &[addr]);
                }
            }
            self.write_state(mem, pass, |s| s.holds_read_lock = false);
        }
        Ok(())
    }

    /// Flags the backup pool for recovery if its latch was left held.
    pub(super) fn release_pool(&mut self, mem: &mut SharedMemory, pass: &Pass) {
        let probe = self.tools.probe;
        let Some(pool) = mem.pools.probe_write(pass.state.pool, probe) else {
            return;
        };
        let ShmPool {
            crit_latch,
            blocked,
        } = pool;
        let outcome = self
            .tools
            .reaper
            .seize_and_release(crit_latch, || *blocked = true);
        if outcome.released() {
            self.report.latches_reaped += 1;
            self.write_node(mem, pass, |node| {
                node.pool_blocked_by_cleanup = node.pool_blocked_by_cleanup.wrapping_add(1);
            });
        }
    }

    /// Frees the critical-section latches whose owners are gone.
    pub(super) fn reap_crit_latches(&mut self, mem: &mut SharedMemory, pass: &Pass) {
        let probe = self.tools.probe;
        if mem.nodes.probe_write(Some(pass.node), probe).is_none() {
            return;
        }
        let Some(crit) = mem.crits.probe_write(pass.state.crit, probe) else {
            return;
        };
        let reaper = self.tools.reaper;
        let exiting = self.ctx.is_exiting();
        let CritSection {
            semaphore,
            crash_count_latch,
            process_queue_latch,
            free_queue_latch,
            ..
        } = &*crit;
        let reaped = [semaphore, crash_count_latch, process_queue_latch, free_queue_latch]
            .into_iter()
            .filter(|&latch| reaper.reap(latch, exiting).released())
            .count();
        self.report.latches_reaped += reaped as u32;
    }

    /// Completes the journal-pool record the process was publishing and
    /// releases the pool's write lock.
    pub(super) fn journal_pool(&mut self, mem: &mut SharedMemory) {
        let probe = self.tools.probe;
        let Some(descriptor) = self.ctx.journal_pool_region else {
            return;
        };
        let view = match resolve::region(mem, Some(descriptor), probe) {
            Ok(view) => view,
            Err(Skip::Unreadable(site)) => {
                self.diag.record(site, &[mem.regions.address_of(Some(descriptor))]);
                return;
            }
            Err(_) => return,
        };
        let Some(state) = mem.states.probe_read(Some(view.state), probe).copied() else {
            self.diag.record(DiagSite::RegionStateUnwritable, &[]);
            return;
        };
        if !state.holds_write_lock {
            return;
        }
        let pid = self.ctx.pid();
        if self.underway.any() {
            match jnlpool::complete_tail(mem, state.journal_pool, self.config.profile, probe) {
                Tail::Completed { length } => {
                    tracing::debug!(length, "journal pool tail completed");
                    self.report.journal_pool_fixed = true;
                }
                Tail::Unwritable => {
                    let addr = mem.journal_pools.address_of(state.journal_pool);
                    self.diag.record(DiagSite::JournalPoolUnwritable, &[addr]);
                }
                Tail::Idle => {}
            }
        }

        if let Some(node) = mem.nodes.probe_write(state.node, probe) {
            if node.write_lock_owner == pid {
                node.write_lock_owner = 0;
            }
        }
        let lock = self.tools.lock;
        let released = mem
            .crits
            .probe_read(state.crit, probe)
            .is_some_and(|crit| lock.unlock_write(crit, pid, crit.crash_count));
        if released {
            self.report.locks_released += 1;
        } else {
            let addr = mem.crits.address_of(state.crit);
            self.diag.record(DiagSite::LockReleaseFailed, &[addr, u64::from(pid)]);
        }
        match mem.states.probe_write(Some(view.state), probe) {
            Some(state) => state.holds_write_lock = false,
            None => self.diag.record(DiagSite::RegionStateUnwritable, &[]),
        }
    }
}
