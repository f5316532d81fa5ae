//! Error types for Rundown core.

use crate::accounting::DiagSite;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can stop a cleanup sweep.
///
/// Probe failures are never errors: the sweep records them and moves on.
/// Only a broken invariant under [`InvariantPolicy::Abort`] ends it early.
///
/// [`InvariantPolicy::Abort`]: crate::InvariantPolicy::Abort
#[derive(Debug, Error)]
pub enum CoreError {
    /// A consistency check failed and the policy is to stop.
    #[error("invariant violated at {site}: {detail}")]
    InvariantViolation {
        /// Where the check failed.
        site: DiagSite,
        /// What was expected.
        detail: &'static str,
    },
}

impl CoreError {
    /// Creates an invariant violation error.
    pub fn invariant_violation(site: DiagSite, detail: &'static str) -> Self {
        Self::InvariantViolation { site, detail }
    }

    /// Returns the diagnostic site of the failed check.
    #[must_use]
    pub fn site(&self) -> DiagSite {
        match self {
            Self::InvariantViolation { site, .. } => *site,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_message_names_site() {
        let err = CoreError::invariant_violation(DiagSite::CommitWithoutLock, "write lock held");
        assert_eq!(err.site(), DiagSite::CommitWithoutLock);
        assert!(err.to_string().contains("commit-without-lock"));
    }
}
