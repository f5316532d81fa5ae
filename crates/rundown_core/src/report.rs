//! Summary of one sweep.

use crate::classify::CommitUnderway;
use crate::context::CleanupReason;

/// What a [`Rundown::run`](crate::Rundown::run) call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RundownReport {
    /// Why the sweep ran.
    pub reason: CleanupReason,
    /// Classification made at the start of the sweep.
    ///
    /// `non_tp` may have been raised during the sweep by a region found
    /// mid-commit.
    pub underway: CommitUnderway,
    /// Regions whose descriptor chain probed clean.
    pub regions_visited: u32,
    /// Regions skipped: unopened, aliased, unsupported or unprobable.
    pub regions_skipped: u32,
    /// Regions whose element list was replayed.
    pub regions_rolled_forward: u32,
    /// Elements moved to the committed mode by this sweep.
    pub elements_replayed: u32,
    /// Elements abandoned after a failed probe or build.
    pub elements_skipped: u32,
    /// Region write or read locks released.
    pub locks_released: u32,
    /// Latches released on behalf of this or a dead process.
    pub latches_reaped: u32,
    /// Regions whose cache was flagged for recovery.
    pub cache_blocked: u32,
    /// Whether the journal-pool tail was completed.
    pub journal_pool_fixed: bool,
    /// Diagnostics at warning or above recorded anywhere.
    pub diagnostics: u32,
}

impl RundownReport {
    pub(crate) const fn new(reason: CleanupReason) -> Self {
        Self {
            reason,
            underway: CommitUnderway::NONE,
            regions_visited: 0,
            regions_skipped: 0,
            regions_rolled_forward: 0,
            elements_replayed: 0,
            elements_skipped: 0,
            locks_released: 0,
            latches_reaped: 0,
            cache_blocked: 0,
            journal_pool_fixed: false,
            diagnostics: 0,
        }
    }

    /// Returns true if the sweep changed nothing but latches it found free.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.elements_replayed == 0
            && self.locks_released == 0
            && self.latches_reaped == 0
            && self.cache_blocked == 0
            && !self.journal_pool_fixed
    }
}
