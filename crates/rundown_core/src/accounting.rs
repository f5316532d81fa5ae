//! Accounting and diagnostics.
//!
//! Every anomaly the sweep survives is recorded under a [`DiagSite`], a
//! closed set of stable codes. Entries go to the region's node-local trace
//! table while accounting is enabled for that region, otherwise to the
//! process-level table kept by [`Diagnostics`]. Warnings and errors are also
//! emitted as `tracing` events. Recording never changes what the sweep does.

use rundown_storage::{Severity, TraceTable};
use std::fmt;

macro_rules! diag_sites {
    ($($(#[$doc:meta])* $name:ident = $code:literal, $label:literal, $severity:ident;)+) => {
        /// Where in the sweep an accounting entry was written.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum DiagSite {
            $($(#[$doc])* $name,)+
        }

        impl DiagSite {
            /// Every site, in code order.
            pub const ALL: &'static [DiagSite] = &[$(DiagSite::$name,)+];

            /// Stable numeric code.
            #[must_use]
            pub const fn code(self) -> u32 {
                match self {
                    $(Self::$name => $code,)+
                }
            }

            /// Short kebab-case label.
            #[must_use]
            pub const fn label(self) -> &'static str {
                match self {
                    $(Self::$name => $label,)+
                }
            }

            /// Severity entries at this site are recorded with.
            #[must_use]
            pub const fn severity(self) -> Severity {
                match self {
                    $(Self::$name => Severity::$severity,)+
                }
            }

            /// Looks a site up by code.
            #[must_use]
            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(Self::$name),)+
                    _ => None,
                }
            }
        }
    };
}

diag_sites! {
    /// Pid and reason of the invoking process.
    Invocation = 1, "invocation", Info;
    /// Commit counter when the region was entered.
    CommitCounter = 2, "commit-counter", Info;
    /// Roll-forward started: mode and element count.
    ReplayStart = 3, "replay-start", Info;
    /// Transaction globals could not be read.
    GlobalsUnreadable = 10, "globals-unreadable", Warning;
    /// A directory or the directory list could not be read.
    DirectoryUnreadable = 11, "directory-unreadable", Warning;
    /// A region descriptor could not be read.
    RegionUnreadable = 12, "region-unreadable", Warning;
    /// A segment descriptor could not be read.
    SegmentUnreadable = 13, "segment-unreadable", Warning;
    /// A file control block could not be read.
    FileControlUnreadable = 14, "file-control-unreadable", Warning;
    /// The process region state is not writable.
    RegionStateUnwritable = 15, "region-state-unwritable", Warning;
    /// The shared header is not writable.
    HeaderUnwritable = 16, "header-unwritable", Warning;
    /// The node-local control block is not writable.
    NodeLocalUnwritable = 17, "node-local-unwritable", Warning;
    /// A sub-transaction could not be read.
    SubTransactionUnreadable = 20, "sub-transaction-unreadable", Warning;
    /// A commit element could not be read or written.
    ElementUnreadable = 21, "element-unreadable", Warning;
    /// A newer version of an element could not be read.
    NewerChainBroken = 22, "newer-chain-broken", Warning;
    /// The single-region element array could not be read.
    ElementArrayUnreadable = 23, "element-array-unreadable", Warning;
    /// The shared section or cache slot array failed validation.
    CacheArrayInvalid = 30, "cache-array-invalid", Warning;
    /// A cache slot could not be written.
    CacheSlotUnwritable = 31, "cache-slot-unwritable", Warning;
    /// No cache slot was available for a replayed block.
    NoVictimSlot = 32, "no-victim-slot", Warning;
    /// The target page is not writable.
    PageUnwritable = 33, "page-unwritable", Warning;
    /// A bitmap before-image could not be read.
    BeforeImageUnreadable = 34, "before-image-unreadable", Warning;
    /// The bitmap builder rejected its input.
    BitmapBuildFailed = 35, "bitmap-build-failed", Warning;
    /// The block builder rejected its input.
    BlockBuildFailed = 36, "block-build-failed", Warning;
    /// A pointer insertion offset or index was out of range.
    InsertOffsetInvalid = 37, "insert-offset-invalid", Warning;
    /// The root insertion of a following element was out of range.
    RootInsertInvalid = 38, "root-insert-invalid", Warning;
    /// A forward-reference chain record failed validation.
    FixupChainBroken = 39, "fixup-chain-broken", Warning;
    /// Kill bookkeeping could not be written.
    KillStateUnwritable = 40, "kill-state-unwritable", Warning;
    /// Journal private state could not be written.
    JournalUnreadable = 50, "journal-unreadable", Warning;
    /// Lock bookkeeping (node-local or critical section) is not writable.
    LockStateUnwritable = 51, "lock-state-unwritable", Warning;
    /// The region lock refused the release.
    LockReleaseFailed = 52, "lock-release-failed", Warning;
    /// The cache was marked for rebuild.
    CacheBlocked = 53, "cache-blocked", Warning;
    /// The journal pool or its record header is not writable.
    JournalPoolUnwritable = 60, "journal-pool-unwritable", Warning;
    /// Normal termination found a commit in flight.
    UnderwayAtNormalExit = 90, "underway-at-normal-exit", Error;
    /// A commit failure found nothing in flight.
    NotUnderwayOnFailure = 91, "not-underway-on-failure", Error;
    /// A region was mid-commit without its write lock.
    CommitWithoutLock = 92, "commit-without-lock", Error;
    /// A mid-commit region was not the one being committed.
    UnexpectedCommitRegion = 93, "unexpected-commit-region", Error;
    /// Commit counters disagree after release.
    CounterMismatch = 94, "counter-mismatch", Error;
}

impl fmt::Display for DiagSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Emits the `tracing` event for an entry.
pub(crate) fn emit(site: DiagSite, words: &[u64]) {
    match site.severity() {
        Severity::Info => tracing::debug!(site = %site, ?words, "accounting"),
        Severity::Warning => tracing::warn!(site = %site, code = site.code(), ?words, "rundown anomaly"),
        Severity::Error => {
            tracing::error!(site = %site, code = site.code(), ?words, "rundown invariant violated")
        }
    }
}

/// Process-level diagnostics sink.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    table: TraceTable,
    recorded: u32,
}

impl Diagnostics {
    /// Creates a sink with a preallocated table of `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: TraceTable::with_capacity(capacity),
            recorded: 0,
        }
    }

    /// Records an entry in the process-level table.
    pub fn record(&mut self, site: DiagSite, words: &[u64]) {
        self.table.append(site.severity(), site.code(), words);
        self.note(site, words);
    }

    /// Counts and traces an entry written elsewhere (a region's table) or
    /// dropped because accounting was off for its region.
    pub fn note(&mut self, site: DiagSite, words: &[u64]) {
        if site.severity() >= Severity::Warning {
            self.recorded = self.recorded.saturating_add(1);
        }
        emit(site, words);
    }

    /// Warnings and errors seen since the last reset.
    #[must_use]
    pub fn recorded(&self) -> u32 {
        self.recorded
    }

    /// The process-level table.
    #[must_use]
    pub fn table(&self) -> &TraceTable {
        &self.table
    }

    /// Empties the table and zeroes the count.
    pub fn reset(&mut self) {
        self.table.reset();
        self.recorded = 0;
    }
}

/// Newest-first rendering of a trace table.
///
/// ```
/// use rundown_core::{DiagSite, TraceDump};
/// use rundown_storage::{Severity, TraceTable};
///
/// let mut table = TraceTable::with_capacity(4);
/// table.append(Severity::Warning, DiagSite::NoVictimSlot.code(), &[7, 0x40]);
/// let text = TraceDump(&table).to_string();
/// assert!(text.starts_with("[0] warning no-victim-slot (32): 0x7 0x40"));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TraceDump<'a>(pub &'a TraceTable);

impl fmt::Display for TraceDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (age, entry) in self.0.newest_first().enumerate() {
            let severity = match entry.severity {
                Some(Severity::Info) => "info",
                Some(Severity::Warning) => "warning",
                Some(Severity::Error) => "error",
                None => "unused",
            };
            let label = DiagSite::from_code(entry.site).map_or("unknown", DiagSite::label);
            write!(f, "[{age}] {severity} {label} ({}):", entry.site)?;
            for word in entry.payload() {
                write!(f, " {word:#x}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn codes_are_unique_and_round_trip() {
        let mut seen = HashSet::new();
        for &site in DiagSite::ALL {
            assert!(seen.insert(site.code()), "duplicate code {}", site.code());
            assert_eq!(DiagSite::from_code(site.code()), Some(site));
        }
        assert_eq!(DiagSite::from_code(0), None);
    }

    #[test]
    fn info_entries_are_not_counted() {
        let mut diag = Diagnostics::with_capacity(4);
        diag.record(DiagSite::Invocation, &[1, 2]);
        diag.record(DiagSite::PageUnwritable, &[3]);
        diag.note(DiagSite::CounterMismatch, &[]);
        assert_eq!(diag.recorded(), 2);
        assert_eq!(diag.table().len(), 2);
        diag.reset();
        assert_eq!(diag.recorded(), 0);
        assert!(diag.table().is_empty());
    }

    #[test]
    fn dump_is_newest_first() {
        let mut table = TraceTable::with_capacity(3);
        table.append(Severity::Info, DiagSite::Invocation.code(), &[9]);
        table.append(Severity::Error, DiagSite::CounterMismatch.code(), &[]);
        let text = TraceDump(&table).to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "[0] error counter-mismatch (94):");
        assert_eq!(lines[1], "[1] info invocation (1): 0x9");
    }

    #[test]
    fn dump_of_empty_table_is_empty() {
        assert_eq!(TraceDump(&TraceTable::with_capacity(2)).to_string(), "");
    }
}
