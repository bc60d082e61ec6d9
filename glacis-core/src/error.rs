//! Error types for glacis-core.

use glacis_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The policy engine's database budget was exceeded; the caller treats
    /// the decision as `no_matching_policy` and audits the slow query.
    #[error("policy engine budget exceeded after {0} ms")]
    Budget(u64),

    /// Routing table mutation rejected (rebind with live stays, unknown IP).
    #[error("routing conflict: {0}")]
    Routing(String),

    /// Stay referenced by a caller is not (or no longer) live.
    #[error("stay {0} is not live")]
    StayNotLive(i64),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),

    /// Transcoder subprocess failure.
    #[error("transcode failed: {0}")]
    Transcode(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Whether the error is a capacity rejection rather than a fault.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, CoreError::Store(StoreError::ResourceExhausted(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_display() {
        let err = CoreError::Budget(500);
        assert_eq!(err.to_string(), "policy engine budget exceeded after 500 ms");
    }

    #[test]
    fn test_resource_exhausted_classification() {
        let err = CoreError::Store(StoreError::ResourceExhausted("queue full".into()));
        assert!(err.is_resource_exhausted());
        assert!(!CoreError::Budget(500).is_resource_exhausted());
    }
}
