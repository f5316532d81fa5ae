//! Releasing latches left behind by dead or exiting owners.

use rundown_storage::{Latch, LatchOwner};

/// Answers whether a process still exists.
pub trait LivenessOracle {
    /// Returns true if `pid` is alive. `generation` is the owner generation
    /// recorded in the latch, or 0 when generations are not compared.
    fn is_alive(&self, pid: u32, generation: u32) -> bool;
}

/// What the reaper did with a latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// The latch was free.
    Free,
    /// Held by the invoking process, which is exiting; cleared.
    ReleasedOwn,
    /// Held by a dead process; released by compare-and-swap.
    ReleasedDead,
    /// Held by the invoking process, which keeps running.
    HeldBySelf,
    /// Held by a live process; untouched.
    OwnerAlive,
    /// The owner changed between the read and the swap; untouched.
    Raced,
}

impl ReapOutcome {
    /// Returns true if the latch was released by this call.
    #[must_use]
    pub const fn released(self) -> bool {
        matches!(self, Self::ReleasedOwn | Self::ReleasedDead)
    }
}

/// Releases latches whose owners can no longer release them.
///
/// A dead owner's latch is freed with a compare-and-swap keyed to the exact
/// `(pid, generation)` word that was read, so a process that grabbed the
/// latch in between keeps it.
#[derive(Clone, Copy)]
pub struct LatchReaper<'a> {
    oracle: &'a dyn LivenessOracle,
    me: LatchOwner,
    generation_aware: bool,
}

impl<'a> LatchReaper<'a> {
    /// Creates a reaper acting for `me`.
    #[must_use]
    pub fn new(oracle: &'a dyn LivenessOracle, me: LatchOwner, generation_aware: bool) -> Self {
        Self {
            oracle,
            me,
            generation_aware,
        }
    }

    fn owner_dead(&self, owner: LatchOwner) -> bool {
        let generation = if self.generation_aware {
            owner.generation
        } else {
            0
        };
        !self.oracle.is_alive(owner.pid, generation)
    }

    /// Releases `latch` if the invoking process owns it and is exiting, or
    /// if its owner is dead.
    pub fn reap(&self, latch: &Latch, exiting: bool) -> ReapOutcome {
        match latch.owner() {
            None => ReapOutcome::Free,
            Some(owner) if owner.pid == self.me.pid => {
                if exiting {
                    latch.force_release();
                    ReapOutcome::ReleasedOwn
                } else {
                    ReapOutcome::HeldBySelf
                }
            }
            Some(owner) if self.owner_dead(owner) => {
                if latch.release_if(owner) {
                    ReapOutcome::ReleasedDead
                } else {
                    ReapOutcome::Raced
                }
            }
            Some(_) => ReapOutcome::OwnerAlive,
        }
    }

    /// Takes `latch` from a dead owner (or finds it already ours), runs
    /// `while_held`, then frees it.
    ///
    /// Used where the protected structure must be flagged for recovery
    /// before anyone else can acquire the latch.
    pub fn seize_and_release<F: FnOnce()>(&self, latch: &Latch, while_held: F) -> ReapOutcome {
        match latch.owner() {
            None => ReapOutcome::Free,
            Some(owner) if owner.pid == self.me.pid => {
                while_held();
                latch.force_release();
                ReapOutcome::ReleasedOwn
            }
            Some(owner) if self.owner_dead(owner) => {
                if !latch.compare_and_swap(owner, self.me) {
                    return ReapOutcome::Raced;
                }
                while_held();
                if latch.release_if(self.me) {
                    ReapOutcome::ReleasedDead
                } else {
                    ReapOutcome::Raced
                }
            }
            Some(_) => ReapOutcome::OwnerAlive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Oracle {
        dead: &'static [u32],
        calls: RefCell<Vec<(u32, u32)>>,
    }

    impl Oracle {
        fn new(dead: &'static [u32]) -> Self {
            Self {
                dead,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl LivenessOracle for Oracle {
        fn is_alive(&self, pid: u32, generation: u32) -> bool {
            self.calls.borrow_mut().push((pid, generation));
            !self.dead.contains(&pid)
        }
    }

    const ME: LatchOwner = LatchOwner::new(10, 1);

    #[test]
    fn free_latch_is_untouched() {
        let oracle = Oracle::new(&[]);
        let reaper = LatchReaper::new(&oracle, ME, true);
        assert_eq!(reaper.reap(&Latch::new(), true), ReapOutcome::Free);
        assert!(oracle.calls.borrow().is_empty());
    }

    #[test]
    fn own_latch_released_only_when_exiting() {
        let oracle = Oracle::new(&[]);
        let reaper = LatchReaper::new(&oracle, ME, true);
        let latch = Latch::held_by(LatchOwner::new(10, 1));
        assert_eq!(reaper.reap(&latch, false), ReapOutcome::HeldBySelf);
        assert!(!latch.is_free());
        assert_eq!(reaper.reap(&latch, true), ReapOutcome::ReleasedOwn);
        assert!(latch.is_free());
    }

    #[test]
    fn dead_owner_released_by_swap() {
        let oracle = Oracle::new(&[77]);
        let reaper = LatchReaper::new(&oracle, ME, true);
        let latch = Latch::held_by(LatchOwner::new(77, 5));
        assert_eq!(reaper.reap(&latch, false), ReapOutcome::ReleasedDead);
        assert!(latch.is_free());
        assert_eq!(oracle.calls.borrow().as_slice(), &[(77, 5)]);
    }

    #[test]
    fn live_owner_kept() {
        let oracle = Oracle::new(&[]);
        let reaper = LatchReaper::new(&oracle, ME, true);
        let latch = Latch::held_by(LatchOwner::new(55, 2));
        assert_eq!(reaper.reap(&latch, true), ReapOutcome::OwnerAlive);
        assert_eq!(latch.owner_pid(), 55);
    }

    #[test]
    fn generation_can_be_ignored() {
        let oracle = Oracle::new(&[]);
        let reaper = LatchReaper::new(&oracle, ME, false);
        let latch = Latch::held_by(LatchOwner::new(55, 9));
        reaper.reap(&latch, true);
        assert_eq!(oracle.calls.borrow().as_slice(), &[(55, 0)]);
    }

    #[test]
    fn seize_runs_closure_while_owned() {
        let oracle = Oracle::new(&[77]);
        let reaper = LatchReaper::new(&oracle, ME, true);
        let latch = Latch::held_by(LatchOwner::new(77, 5));
        let mut owner_inside = None;
        let outcome = reaper.seize_and_release(&latch, || owner_inside = latch.owner());
        assert_eq!(outcome, ReapOutcome::ReleasedDead);
        assert_eq!(owner_inside, Some(ME));
        assert!(latch.is_free());
    }

    #[test]
    fn seize_skips_live_owner() {
        let oracle = Oracle::new(&[]);
        let reaper = LatchReaper::new(&oracle, ME, true);
        let latch = Latch::held_by(LatchOwner::new(55, 2));
        let mut ran = false;
        assert_eq!(
            reaper.seize_and_release(&latch, || ran = true),
            ReapOutcome::OwnerAlive
        );
        assert!(!ran);
    }
}
