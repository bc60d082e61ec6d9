//! Error types for glacis-store.

use thiserror::Error;

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying Diesel error.
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Failed to obtain a pooled connection.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Row lookup that the caller expected to succeed.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Write rejected because it would break a uniqueness rule
    /// (double allocation, overlapping source IP, rebind with live stays).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Write rejected by a policy-level rule (group cycle, bad window).
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Capacity limit reached (transcode pending queue).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Two rows observed where at most one may exist. The caller is
    /// expected to tear down whatever depends on the implicated row.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<diesel::r2d2::PoolError> for StoreError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        StoreError::Pool(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = StoreError::NotFound {
            entity: "backend",
            id: "42".to_string(),
        };
        assert_eq!(err.to_string(), "backend not found: 42");
    }

    #[test]
    fn test_conflict_display() {
        let err = StoreError::Conflict("proxy IP 10.0.0.1 already bound".to_string());
        assert!(err.to_string().contains("already bound"));
    }

    #[test]
    fn test_resource_exhausted_display() {
        let err = StoreError::ResourceExhausted("transcode queue full".to_string());
        assert_eq!(err.to_string(), "resource exhausted: transcode queue full");
    }
}
