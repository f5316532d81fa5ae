//! Fixed-capacity accounting trace.
//!
//! The table is a circular buffer written without allocation: every entry
//! slot exists from construction and appends overwrite the oldest slot once
//! the table is full.

/// Payload words per entry.
pub const TRACE_WORDS: usize = 9;

/// Entry severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Bookkeeping (who ran, why, at which commit counter).
    Info,
    /// Something was skipped or repaired.
    Warning,
    /// A consistency check failed.
    Error,
}

/// One accounting record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    /// Severity, or `None` for an unused slot.
    pub severity: Option<Severity>,
    /// Stable site code of the recorder.
    pub site: u32,
    /// Number of valid payload words.
    pub len: u8,
    /// Payload.
    pub words: [u64; TRACE_WORDS],
}

impl TraceEntry {
    /// An unused slot.
    pub const EMPTY: Self = Self {
        severity: None,
        site: 0,
        len: 0,
        words: [0; TRACE_WORDS],
    };

    /// Returns true for a slot never written since the last reset.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.severity.is_none()
    }

    /// Valid payload words.
    #[must_use]
    pub fn payload(&self) -> &[u64] {
        let len = usize::from(self.len).min(TRACE_WORDS);
        &self.words[..len]
    }
}

/// Circular accounting table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TraceTable {
    entries: Vec<TraceEntry>,
    cursor: usize,
}

impl TraceTable {
    /// Creates a table holding `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: vec![TraceEntry::EMPTY; capacity],
            cursor: 0,
        }
    }

    /// Number of entry slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Appends an entry, overwriting the oldest when full.
    ///
    /// Words beyond [`TRACE_WORDS`] are dropped. A zero-capacity table
    /// records nothing.
    pub fn append(&mut self, severity: Severity, site: u32, words: &[u64]) {
        let Some(slot) = self.entries.get_mut(self.cursor) else {
            return;
        };
        let len = words.len().min(TRACE_WORDS);
        let mut entry = TraceEntry {
            severity: Some(severity),
            site,
            len: len as u8,
            words: [0; TRACE_WORDS],
        };
        entry.words[..len].copy_from_slice(&words[..len]);
        *slot = entry;
        self.cursor += 1;
        if self.cursor == self.entries.len() {
            self.cursor = 0;
        }
    }

    /// Marks every slot unused.
    pub fn reset(&mut self) {
        self.entries.fill(TraceEntry::EMPTY);
        self.cursor = 0;
    }

    /// Entries from newest to oldest, stopping at the first unused slot.
    pub fn newest_first(&self) -> impl Iterator<Item = &TraceEntry> + '_ {
        let (recent, wrapped) = self.entries.split_at(self.cursor);
        recent
            .iter()
            .rev()
            .chain(wrapped.iter().rev())
            .take_while(|entry| !entry.is_unused())
    }

    /// Number of used slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_unused()).count()
    }

    /// Returns true if nothing was recorded since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sites(table: &TraceTable) -> Vec<u32> {
        table.newest_first().map(|e| e.site).collect()
    }

    #[test]
    fn newest_first_before_wrap() {
        let mut table = TraceTable::with_capacity(4);
        table.append(Severity::Info, 1, &[10]);
        table.append(Severity::Warning, 2, &[20, 21]);
        assert_eq!(sites(&table), vec![2, 1]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let mut table = TraceTable::with_capacity(3);
        for site in 1..=5 {
            table.append(Severity::Info, site, &[]);
        }
        assert_eq!(sites(&table), vec![5, 4, 3]);
    }

    #[test]
    fn reset_empties() {
        let mut table = TraceTable::with_capacity(2);
        table.append(Severity::Error, 7, &[1]);
        table.reset();
        assert!(table.is_empty());
        assert_eq!(sites(&table), Vec::<u32>::new());
    }

    #[test]
    fn zero_capacity_is_inert() {
        let mut table = TraceTable::default();
        table.append(Severity::Error, 7, &[1]);
        assert!(table.is_empty());
    }

    #[test]
    fn long_payload_is_truncated() {
        let mut table = TraceTable::with_capacity(1);
        table.append(Severity::Info, 1, &[7; 12]);
        let entry = table.newest_first().next().unwrap();
        assert_eq!(entry.payload().len(), TRACE_WORDS);
    }

    proptest! {
        #[test]
        fn keeps_the_newest_entries(capacity in 1usize..8, appended in prop::collection::vec(0u32..100, 0..20)) {
            let mut table = TraceTable::with_capacity(capacity);
            for &site in &appended {
                table.append(Severity::Warning, site, &[u64::from(site)]);
            }
            let expected: Vec<u32> = appended.iter().rev().take(capacity).copied().collect();
            prop_assert_eq!(sites(&table), expected);
            prop_assert_eq!(table.len(), appended.len().min(capacity));
        }
    }
}
