//! Region lock release.

use rundown_storage::{CritSection, LatchOwner};

/// Releases the region locks held in a critical section.
pub trait RegionLock {
    /// Releases the write lock held by `pid`, acquired when the crash count
    /// was `generation`. Returns false if the lock was not released.
    fn unlock_write(&self, crit: &CritSection, pid: u32, generation: u32) -> bool;

    /// Drops one read-lock hold.
    fn unlock_read(&self, crit: &mut CritSection) -> bool;
}

/// [`RegionLock`] over the critical section's write latch and reader count.
///
/// The write latch word carries the crash count current when it was taken;
/// a release whose generation no longer matches is refused, since another
/// process has already recovered the lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct CritLock;

impl RegionLock for CritLock {
    fn unlock_write(&self, crit: &CritSection, pid: u32, generation: u32) -> bool {
        if crit.crash_count != generation {
            return false;
        }
        crit.write_latch.release_if(LatchOwner::new(pid, generation))
    }

    fn unlock_read(&self, crit: &mut CritSection) -> bool {
        match crit.readers.checked_sub(1) {
            Some(readers) => {
                crit.readers = readers;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rundown_storage::Latch;

    fn crit_held_by(pid: u32, crash_count: u32) -> CritSection {
        CritSection {
            write_latch: Latch::held_by(LatchOwner::new(pid, crash_count)),
            crash_count,
            ..CritSection::default()
        }
    }

    #[test]
    fn write_unlock_matches_owner_and_generation() {
        let crit = crit_held_by(7, 3);
        assert!(!CritLock.unlock_write(&crit, 8, 3));
        assert!(!CritLock.unlock_write(&crit, 7, 2));
        assert!(CritLock.unlock_write(&crit, 7, 3));
        assert!(crit.write_latch.is_free());
    }

    #[test]
    fn stale_generation_is_refused() {
        let mut crit = crit_held_by(7, 3);
        crit.crash_count = 4;
        assert!(!CritLock.unlock_write(&crit, 7, 3));
        assert_eq!(crit.write_latch.owner_pid(), 7);
    }

    #[test]
    fn read_unlock_never_underflows() {
        let mut crit = CritSection {
            readers: 1,
            ..CritSection::default()
        };
        assert!(CritLock.unlock_read(&mut crit));
        assert!(!CritLock.unlock_read(&mut crit));
        assert_eq!(crit.readers, 0);
    }
}
