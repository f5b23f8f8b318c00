//! Error types for the Quiver control plane.

/// Result type alias for Quiver operations.
pub type Result<T> = std::result::Result<T, QuiverError>;

/// Main error type for the Quiver control plane.
///
/// The variants follow the platform error taxonomy: validation and conflict
/// errors are surfaced to the caller unchanged, unavailability and timeouts
/// are retryable, and per-item failures are recorded on the task rather than
/// raised as errors.
#[derive(Debug, thiserror::Error)]
pub enum QuiverError {
    /// Malformed request, dimension mismatch, unknown filter field
    #[error("Validation error: {0}")]
    Validation(String),

    /// Task/collection/session/model absent
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Duplicate task, blue deletion, concurrent reindex of the same pair
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Illegal task status transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Vector store, inference server, or queue unreachable
    #[error("Dependency unavailable: {0}")]
    Unavailable(String),

    /// Bounded timeout on an external call
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Too many concurrent deployments or an oversized batch
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Cancellation observed at a checkpoint
    #[error("Canceled by user")]
    Canceled,

    /// Database-level errors that are not connectivity problems
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl QuiverError {
    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a new conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new invalid transition error
    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a new unavailable-dependency error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new capacity error
    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    /// Create a new database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a retry with backoff may succeed.
    ///
    /// Only connectivity loss and timeouts qualify; validation, conflicts and
    /// state-machine violations are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Check if this is a cancellation
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(QuiverError::unavailable("broker down").is_retryable());
        assert!(QuiverError::timeout("inference call").is_retryable());
        assert!(!QuiverError::validation("bad dims").is_retryable());
        assert!(!QuiverError::conflict("blue collection").is_retryable());
        assert!(!QuiverError::Canceled.is_retryable());
    }

    #[test]
    fn not_found_display() {
        let err = QuiverError::not_found("task", "t1");
        assert_eq!(err.to_string(), "Not found: task with id t1");
        assert!(err.is_not_found());
    }
}
