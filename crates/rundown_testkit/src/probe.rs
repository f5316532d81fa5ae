//! Fault-injecting memory probes.

use parking_lot::Mutex;
use rundown_storage::{Access, Mapping, MappingProbe, MemoryProbe};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Wraps a probe, counts calls, and fails chosen ones.
///
/// Faults are scheduled by call number (0-based) or by mapping base
/// address. A faulted probe answers false without consulting the inner
/// probe, which is how a page unmapped by another process looks.
pub struct CountingProbe<P = MappingProbe> {
    inner: P,
    calls: AtomicU64,
    fail_calls: Mutex<HashSet<u64>>,
    fail_bases: Mutex<HashSet<u64>>,
    fail_from: Mutex<Option<u64>>,
}

impl Default for CountingProbe {
    fn default() -> Self {
        Self::new(MappingProbe)
    }
}

impl<P: MemoryProbe> CountingProbe<P> {
    /// Wraps `inner` with no faults scheduled.
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            calls: AtomicU64::new(0),
            fail_calls: Mutex::new(HashSet::new()),
            fail_bases: Mutex::new(HashSet::new()),
            fail_from: Mutex::new(None),
        }
    }

    /// Fails call number `call`.
    pub fn fail_call(&self, call: u64) {
        self.fail_calls.lock().insert(call);
    }

    /// Fails every call from number `call` on.
    pub fn fail_from(&self, call: u64) {
        *self.fail_from.lock() = Some(call);
    }

    /// Fails every probe of the mapping starting at `base`.
    pub fn fail_base(&self, base: u64) {
        self.fail_bases.lock().insert(base);
    }

    /// Clears all scheduled faults. The call count keeps running.
    pub fn heal(&self) {
        self.fail_calls.lock().clear();
        self.fail_bases.lock().clear();
        *self.fail_from.lock() = None;
    }

    /// Probes made so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl<P: MemoryProbe> MemoryProbe for CountingProbe<P> {
    fn probe(&self, mapping: Option<&Mapping>, offset: u64, len: u64, access: Access) -> bool {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let faulted = self.fail_calls.lock().contains(&call)
            || self.fail_from.lock().is_some_and(|from| call >= from)
            || mapping.is_some_and(|m| self.fail_bases.lock().contains(&m.base));
        !faulted && self.inner.probe(mapping, offset, len, access)
    }
}

impl<P> std::fmt::Debug for CountingProbe<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingProbe")
            .field("calls", &self.calls.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduled_faults() {
        let probe = CountingProbe::default();
        let map = Mapping::read_write(0x1000, 64);
        probe.fail_call(1);
        assert!(probe.probe(Some(&map), 0, 8, Access::Read));
        assert!(!probe.probe(Some(&map), 0, 8, Access::Read));
        assert!(probe.probe(Some(&map), 0, 8, Access::Read));

        probe.fail_base(0x1000);
        assert!(!probe.probe(Some(&map), 0, 8, Access::Write));
        probe.heal();
        probe.fail_from(5);
        assert!(probe.probe(Some(&map), 0, 8, Access::Write));
        assert!(!probe.probe(Some(&map), 0, 8, Access::Write));
        assert_eq!(probe.calls(), 6);
    }
}
