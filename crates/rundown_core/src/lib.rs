//! # Rundown Core
//!
//! Crash-time commit completion for processes sharing a database through
//! shared memory.
//!
//! When a process exits, dies, or fails mid-commit, [`Rundown::run`] walks
//! every region it had open and:
//! - classifies whether a commit was past its point of no return
//! - rolls such commits forward by rebuilding the remaining blocks
//! - settles the commit counters and releases the region locks
//! - reaps latches left behind by the process or by dead owners
//! - publishes a half-written journal-pool record
//!
//! Nothing here ever dereferences shared state without probing it first.
//! A structure that fails its probe is recorded under a [`DiagSite`] and
//! skipped, so a corrupt image degrades the sweep instead of stopping it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod accounting;
mod builder;
mod classify;
mod config;
mod context;
mod engine;
mod error;
mod jnlpool;
mod latch;
mod lock;
mod report;
mod resolve;

pub use accounting::{DiagSite, Diagnostics, TraceDump};
pub use builder::{
    encode_block_list, encode_records, BitmapBuilder, BitmapInput, BlockBuilder, BuildInput,
    LocalMapBuilder, RecordBlockBuilder,
};
pub use classify::{classify, CommitUnderway};
pub use config::{Config, ExecutionProfile, InvariantPolicy};
pub use context::{CleanupContext, CleanupReason};
pub use engine::Rundown;
pub use error::{CoreError, CoreResult};
pub use jnlpool::wrap_offset;
pub use latch::{LatchReaper, LivenessOracle, ReapOutcome};
pub use lock::{CritLock, RegionLock};
pub use report::RundownReport;
