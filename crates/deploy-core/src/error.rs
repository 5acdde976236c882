//! Error types shared across the orchestrator crates.

use thiserror::Error;

/// Errors produced while ordering a resource set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency cycle among resources: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("resource `{resource}` depends on unknown resource `{missing}`")]
    UnknownDependency { resource: String, missing: String },

    #[error("resource `{0}` is declared more than once")]
    DuplicateResource(String),

    #[error("resource names must not be empty")]
    EmptyName,
}

/// A malformed deployment spec, rejected before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Failure reported by an external collaborator (builder, applier, prober).
///
/// `retryable` tells the stage executor whether another attempt may succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub retryable: bool,
    pub message: String,
}

impl CollaboratorError {
    /// A transient failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    /// A permanent failure; retrying will not help.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_members() {
        let err = GraphError::CyclicDependency(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "dependency cycle among resources: a, b");
    }

    #[test]
    fn graph_errors_convert_to_validation() {
        let err: ValidationError = GraphError::EmptyName.into();
        assert!(matches!(err, ValidationError::Graph(GraphError::EmptyName)));
        assert_eq!(err.to_string(), "resource names must not be empty");
    }

    #[test]
    fn collaborator_constructors() {
        assert!(CollaboratorError::transient("registry 503").retryable);
        assert!(!CollaboratorError::permanent("bad manifest").retryable);
    }
}
