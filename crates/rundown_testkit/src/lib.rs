//! # Rundown Testkit
//!
//! Test utilities for Rundown.
//!
//! This crate provides:
//! - Crash scenario fixtures laying out whole shared-memory images
//! - A scripted liveness oracle
//! - A fault-injecting memory probe
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use rundown_core::{CleanupReason, Config};
//! use rundown_testkit::prelude::*;
//!
//! let mut builder = ScenarioBuilder::new();
//! let region = builder.region(RegionSpec::mapped().in_commit());
//! builder.single_region_commit(&region, &[ElementSpec::acquired(3).records(&[b"abc"])]);
//! let mut scenario = builder.build(CleanupReason::AbnormalTermination);
//!
//! let report = scenario
//!     .run(Config::default(), &CountingProbe::default(), &ScriptedOracle::new())
//!     .unwrap();
//! assert_eq!(report.elements_replayed, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod oracle;
pub mod probe;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
    pub use crate::oracle::*;
    pub use crate::probe::*;
}

pub use fixtures::*;
pub use oracle::ScriptedOracle;
pub use probe::CountingProbe;

/// Installs a `tracing` subscriber for the test binary, filtered by
/// `RUST_LOG` (default `warn`). Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
