//! Liveness oracles for tests.

use parking_lot::Mutex;
use rundown_core::LivenessOracle;
use rundown_storage::LatchOwner;
use std::collections::HashSet;

/// Oracle with a scripted set of dead processes that records every query.
///
/// A process is dead when its pid is listed with no generation, or when
/// the exact `(pid, generation)` pair is listed. The second form models a
/// pid reused by a new process.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    dead_pids: HashSet<u32>,
    dead_owners: HashSet<LatchOwner>,
    calls: Mutex<Vec<(u32, u32)>>,
}

impl ScriptedOracle {
    /// Everyone is alive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks every incarnation of `pid` dead.
    #[must_use]
    pub fn dead(mut self, pid: u32) -> Self {
        self.dead_pids.insert(pid);
        self
    }

    /// Marks one incarnation dead.
    #[must_use]
    pub fn dead_generation(mut self, pid: u32, generation: u32) -> Self {
        self.dead_owners.insert(LatchOwner::new(pid, generation));
        self
    }

    /// Queries made so far, in order.
    pub fn calls(&self) -> Vec<(u32, u32)> {
        self.calls.lock().clone()
    }
}

impl LivenessOracle for ScriptedOracle {
    fn is_alive(&self, pid: u32, generation: u32) -> bool {
        self.calls.lock().push((pid, generation));
        !self.dead_pids.contains(&pid) && !self.dead_owners.contains(&LatchOwner::new(pid, generation))
    }
}
