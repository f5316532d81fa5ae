//! Owner-tagged spin latches.
//!
//! A latch is one 64-bit word: the owning pid in the high half and the
//! owner's generation (image count) in the low half. Zero means free. Every
//! transition is a single atomic operation so a reaper can release a dead
//! owner's latch without racing a live process that acquires it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a latch holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LatchOwner {
    /// Process id. Never 0 for a real owner.
    pub pid: u32,
    /// Generation distinguishing reuses of the same pid.
    pub generation: u32,
}

impl LatchOwner {
    /// Creates an owner identity.
    #[must_use]
    pub const fn new(pid: u32, generation: u32) -> Self {
        Self { pid, generation }
    }

    const fn pack(self) -> u64 {
        ((self.pid as u64) << 32) | self.generation as u64
    }

    const fn unpack(word: u64) -> Option<Self> {
        let pid = (word >> 32) as u32;
        if pid == 0 {
            None
        } else {
            Some(Self {
                pid,
                generation: word as u32,
            })
        }
    }
}

/// A lightweight mutual-exclusion token shared between processes.
#[derive(Default)]
pub struct Latch {
    word: AtomicU64,
}

impl Latch {
    /// Creates a free latch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Creates a latch already held by `owner`.
    #[must_use]
    pub const fn held_by(owner: LatchOwner) -> Self {
        Self {
            word: AtomicU64::new(owner.pack()),
        }
    }

    /// Returns the current owner, if any.
    #[must_use]
    pub fn owner(&self) -> Option<LatchOwner> {
        LatchOwner::unpack(self.word.load(Ordering::Acquire))
    }

    /// Returns the owning pid, or 0 if free.
    #[must_use]
    pub fn owner_pid(&self) -> u32 {
        self.owner().map_or(0, |o| o.pid)
    }

    /// Returns true if nobody holds the latch.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.owner().is_none()
    }

    /// Acquires the latch if it is free. Never waits.
    pub fn try_acquire(&self, owner: LatchOwner) -> bool {
        self.word
            .compare_exchange(0, owner.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Swaps ownership from exactly `expected` to `new`.
    ///
    /// Fails without side effects if the latch is held by anyone else,
    /// including the same pid with a different generation.
    pub fn compare_and_swap(&self, expected: LatchOwner, new: LatchOwner) -> bool {
        self.word
            .compare_exchange(
                expected.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Frees the latch only if it is still held by exactly `expected`.
    pub fn release_if(&self, expected: LatchOwner) -> bool {
        self.word
            .compare_exchange(expected.pack(), 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Frees the latch unconditionally.
    ///
    /// Only legal for the owner itself.
    pub fn force_release(&self) {
        self.word.store(0, Ordering::Release);
    }
}

impl Clone for Latch {
    fn clone(&self) -> Self {
        Self {
            word: AtomicU64::new(self.word.load(Ordering::Acquire)),
        }
    }
}

impl PartialEq for Latch {
    fn eq(&self, other: &Self) -> bool {
        self.word.load(Ordering::Acquire) == other.word.load(Ordering::Acquire)
    }
}

impl Eq for Latch {}

impl fmt::Debug for Latch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner() {
            Some(owner) => write!(f, "Latch(pid {} gen {})", owner.pid, owner.generation),
            None => f.write_str("Latch(free)"),
        }
    }
}
