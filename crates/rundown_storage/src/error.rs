//! Error types for shared-memory model construction.
//!
//! The cleanup sweep itself never sees these: it goes through the probed
//! accessors, which answer `None` instead of failing. These errors come from
//! the unprobed fixture API used by the attach subsystem and by tests.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while building or inspecting the shared-memory model.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    /// A handle does not name a slot of its arena.
    #[error("dangling handle: slot {index} in arena {tag}")]
    DanglingHandle {
        /// Arena tag.
        tag: u32,
        /// Slot index.
        index: u32,
    },

    /// The slot exists but has been unmapped.
    #[error("slot {index} in arena {tag} is unmapped")]
    Unmapped {
        /// Arena tag.
        tag: u32,
        /// Slot index.
        index: u32,
    },

    /// A heap address does not fall inside any live mapping.
    #[error("heap address {addr:#x} (len {len}) is not mapped")]
    UnmappedAddress {
        /// The requested address.
        addr: u64,
        /// The requested length.
        len: u64,
    },

    /// A heap mapping request was empty or too large.
    #[error("invalid heap mapping length {len}")]
    InvalidLength {
        /// The requested length.
        len: u64,
    },
}
