//! Deciding whether a commit passed the point of no return.

use crate::accounting::{DiagSite, Diagnostics};
use crate::config::InvariantPolicy;
use crate::context::{CleanupContext, CleanupReason};
use crate::error::{CoreError, CoreResult};
use crate::resolve;
use rundown_storage::{MemoryProbe, SharedMemory, TransactionGlobals, UpdateState};

/// Which kind of commit, if any, must be rolled forward.
///
/// At most one flag is set: a process is either inside a multi-region
/// transaction or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitUnderway {
    /// A multi-region commit is underway.
    pub tp: bool,
    /// A single-region commit is underway.
    pub non_tp: bool,
}

impl CommitUnderway {
    /// Nothing underway.
    pub const NONE: Self = Self {
        tp: false,
        non_tp: false,
    };

    /// Returns true if either kind is underway.
    #[must_use]
    pub const fn any(self) -> bool {
        self.tp || self.non_tp
    }
}

/// Classifies the invoking process's transaction state.
///
/// A multi-region transaction is underway once any of its sub-transactions
/// (walked in file order) reached the commit-started state, or holds its
/// region's write lock inside the per-block commit loop. A single-region
/// transaction is underway if its region is write-locked and either inside
/// the commit loop or marked commit-started.
///
/// Also checks the invocation reason against the result: a normal exit must
/// find nothing underway, a commit failure must find something.
pub fn classify(
    mem: &SharedMemory,
    ctx: &CleanupContext,
    probe: &dyn MemoryProbe,
    policy: InvariantPolicy,
    diag: &mut Diagnostics,
) -> CoreResult<CommitUnderway> {
    let underway = match mem.globals.probe_read(ctx.globals, probe) {
        Some(globals) if globals.tp_depth > 0 => CommitUnderway {
            tp: multi_region(mem, globals, probe, diag),
            non_tp: false,
        },
        Some(globals) => CommitUnderway {
            tp: false,
            non_tp: single_region(mem, globals, probe),
        },
        None => {
            if ctx.globals.is_some() {
                diag.record(DiagSite::GlobalsUnreadable, &[]);
            }
            CommitUnderway::NONE
        }
    };
    tracing::debug!(tp = underway.tp, non_tp = underway.non_tp, reason = %ctx.reason, "classified");

    match ctx.reason {
        CleanupReason::NormalTermination if underway.any() => violation(
            policy,
            diag,
            DiagSite::UnderwayAtNormalExit,
            "normal termination found a commit underway",
        )?,
        CleanupReason::CommitIncomplete if !underway.any() => violation(
            policy,
            diag,
            DiagSite::NotUnderwayOnFailure,
            "commit failure found no commit underway",
        )?,
        _ => {}
    }
    Ok(underway)
}

/// Records a failed check and, under [`InvariantPolicy::Abort`], fails.
pub(crate) fn violation(
    policy: InvariantPolicy,
    diag: &mut Diagnostics,
    site: DiagSite,
    detail: &'static str,
) -> CoreResult<()> {
    diag.record(site, &[]);
    match policy {
        InvariantPolicy::Abort => Err(CoreError::invariant_violation(site, detail)),
        InvariantPolicy::Record => Ok(()),
    }
}

fn multi_region(
    mem: &SharedMemory,
    globals: &TransactionGlobals,
    probe: &dyn MemoryProbe,
    diag: &mut Diagnostics,
) -> bool {
    let mut cursor = globals.first_by_file;
    for _ in 0..=mem.subtransactions.len() {
        let Some(ptr) = cursor else {
            return false;
        };
        let Some(sub) = mem.subtransactions.probe_read(Some(ptr), probe) else {
            diag.record(DiagSite::SubTransactionUnreadable, &[u64::from(ptr.index())]);
            return false;
        };
        if sub.update_state == UpdateState::CommitStarted {
            return true;
        }
        if mem.elements.probe_read(sub.first, probe).is_some() {
            if let Ok(view) = resolve::region(mem, sub.region, probe) {
                let locked_in_commit = mem
                    .states
                    .probe_read(Some(view.state), probe)
                    .is_some_and(|state| state.holds_write_lock && state.commit_in_progress);
                if locked_in_commit {
                    return true;
                }
            }
        }
        cursor = sub.next_by_file;
    }
    diag.record(DiagSite::SubTransactionUnreadable, &[]);
    false
}

fn single_region(mem: &SharedMemory, globals: &TransactionGlobals, probe: &dyn MemoryProbe) -> bool {
    mem.states
        .probe_read(globals.current_region, probe)
        .is_some_and(|state| {
            state.holds_write_lock
                && (state.commit_in_progress || globals.update_state == UpdateState::CommitStarted)
        })
}
