use thiserror::Error;

/// Structural problems in a workflow definition, detected at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("workflow has no tasks")]
    EmptyGraph,

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("task '{task_id}' depends on unknown task '{missing_id}'")]
    DanglingDependency { task_id: String, missing_id: String },

    #[error("task '{task_id}' has an invalid fallback: {reason}")]
    InvalidFallback { task_id: String, reason: String },
}

/// Error returned by an external capability.
///
/// The tag drives retry: transient errors are retried with backoff,
/// permanent errors abort the task immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl CapabilityError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The circuit breaker for an action is open and rejected the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit open for action '{action}'")]
pub struct CircuitOpenError {
    pub action: String,
}

/// Errors from repository operations (used by trait definitions in taskloom-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_joins_path() {
        let err = GraphError::CycleDetected(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_dangling_display() {
        let err = GraphError::DanglingDependency {
            task_id: "parse".into(),
            missing_id: "fetch".into(),
        };
        assert!(err.to_string().contains("'parse'"));
        assert!(err.to_string().contains("'fetch'"));
    }

    #[test]
    fn test_capability_error_classification() {
        assert!(CapabilityError::transient("rate limited").is_transient());
        assert!(!CapabilityError::permanent("bad input").is_transient());
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }
}
