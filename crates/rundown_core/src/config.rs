//! Sweep configuration.

/// What to do when a consistency check fails during the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvariantPolicy {
    /// Stop and return [`CoreError::InvariantViolation`](crate::CoreError).
    #[default]
    Abort,
    /// Record a diagnostic and keep going.
    Record,
}

/// Arithmetic available to the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionProfile {
    /// No division or modulo; offsets wrap by repeated subtraction and page
    /// math uses shifts.
    #[default]
    Restricted,
    /// Ordinary arithmetic.
    Unrestricted,
}

/// Configuration for a cleanup sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Response to a failed consistency check.
    pub invariant_policy: InvariantPolicy,

    /// Arithmetic profile.
    pub profile: ExecutionProfile,

    /// Pass the recorded owner generation to the liveness oracle. Platforms
    /// that never reuse pids while a segment is attached can pass 0.
    pub generation_aware_liveness: bool,

    /// Write per-region accounting into each node-local trace table.
    pub accounting: bool,

    /// Entries in the process-level trace table.
    pub trace_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            invariant_policy: InvariantPolicy::Abort,
            profile: ExecutionProfile::Restricted,
            generation_aware_liveness: true,
            accounting: true,
            trace_capacity: 64,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the invariant policy.
    #[must_use]
    pub const fn invariant_policy(mut self, policy: InvariantPolicy) -> Self {
        self.invariant_policy = policy;
        self
    }

    /// Sets the execution profile.
    #[must_use]
    pub const fn profile(mut self, profile: ExecutionProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Sets whether liveness checks include the owner generation.
    #[must_use]
    pub const fn generation_aware_liveness(mut self, value: bool) -> Self {
        self.generation_aware_liveness = value;
        self
    }

    /// Sets whether per-region accounting is written.
    #[must_use]
    pub const fn accounting(mut self, value: bool) -> Self {
        self.accounting = value;
        self
    }

    /// Sets the process-level trace table size.
    #[must_use]
    pub const fn trace_capacity(mut self, capacity: usize) -> Self {
        self.trace_capacity = capacity;
        self
    }
}
