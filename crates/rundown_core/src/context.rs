//! Who is running the sweep and why.

use rundown_storage::{DirectoryList, LatchOwner, Ptr, RegionDescriptor, TransactionGlobals};
use std::fmt;

/// Why the sweep was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupReason {
    /// Orderly process exit. No commit may be in flight.
    NormalTermination,
    /// The process is dying from a signal or fatal error.
    AbnormalTermination,
    /// A commit failed past the point of no return; the process keeps
    /// running afterwards.
    CommitIncomplete,
}

impl CleanupReason {
    /// Returns true if the process will not touch shared memory again.
    #[must_use]
    pub const fn is_exiting(self) -> bool {
        !matches!(self, Self::CommitIncomplete)
    }

    /// Stable numeric code written into accounting entries.
    #[must_use]
    pub const fn code(self) -> u64 {
        match self {
            Self::NormalTermination => 1,
            Self::AbnormalTermination => 2,
            Self::CommitIncomplete => 3,
        }
    }
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NormalTermination => "normal-termination",
            Self::AbnormalTermination => "abnormal-termination",
            Self::CommitIncomplete => "commit-incomplete",
        };
        f.write_str(name)
    }
}

/// Everything the sweep reads from the invoking process.
///
/// The handles point into a [`SharedMemory`](rundown_storage::SharedMemory)
/// image and are probed before use like any other shared pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupContext {
    /// Identity used for latch ownership checks.
    pub process: LatchOwner,
    /// Why the sweep runs.
    pub reason: CleanupReason,
    /// The process's transaction globals.
    pub globals: Option<Ptr<TransactionGlobals>>,
    /// Open directories.
    pub directories: Option<Ptr<DirectoryList>>,
    /// Region holding the journal pool, if replication is active.
    pub journal_pool_region: Option<Ptr<RegionDescriptor>>,
}

impl CleanupContext {
    /// Creates a context with no globals, directories or journal pool.
    #[must_use]
    pub const fn new(process: LatchOwner, reason: CleanupReason) -> Self {
        Self {
            process,
            reason,
            globals: None,
            directories: None,
            journal_pool_region: None,
        }
    }

    /// Sets the transaction globals.
    #[must_use]
    pub const fn globals(mut self, globals: Ptr<TransactionGlobals>) -> Self {
        self.globals = Some(globals);
        self
    }

    /// Sets the directory list.
    #[must_use]
    pub const fn directories(mut self, directories: Ptr<DirectoryList>) -> Self {
        self.directories = Some(directories);
        self
    }

    /// Sets the journal-pool region.
    #[must_use]
    pub const fn journal_pool_region(mut self, region: Ptr<RegionDescriptor>) -> Self {
        self.journal_pool_region = Some(region);
        self
    }

    /// Returns true if the process is exiting.
    #[must_use]
    pub const fn is_exiting(&self) -> bool {
        self.reason.is_exiting()
    }

    /// Process id of the invoking process.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.process.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_commit_failure_keeps_running() {
        assert!(CleanupReason::NormalTermination.is_exiting());
        assert!(CleanupReason::AbnormalTermination.is_exiting());
        assert!(!CleanupReason::CommitIncomplete.is_exiting());
    }

    #[test]
    fn context_builder() {
        let ctx = CleanupContext::new(LatchOwner::new(42, 1), CleanupReason::CommitIncomplete)
            .globals(Ptr::from_index(0))
            .directories(Ptr::from_index(3));
        assert_eq!(ctx.pid(), 42);
        assert_eq!(ctx.directories, Some(Ptr::from_index(3)));
        assert!(ctx.journal_pool_region.is_none());
        assert!(!ctx.is_exiting());
    }
}
