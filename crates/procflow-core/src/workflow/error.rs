//! Business errors surfaced by the workflow engine.
//!
//! Every variant carries a stable machine-readable code (see
//! [`WorkflowError::code`]) so a request layer can map failures without
//! matching on display strings.

use procflow_types::error::{DirectoryError, LockError, RepositoryError};
use procflow_types::workflow::InstanceStatus;
use thiserror::Error;
use uuid::Uuid;

use super::expression::ExpressionError;

/// Errors that can occur while authoring definitions or processing actions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Structural validation failure of a definition graph.
    #[error("invalid workflow definition: {0}")]
    DefinitionInvalid(String),

    /// An edge or assignee condition failed expression validation.
    #[error("unsafe expression '{expression}': {reason}")]
    UnsafeExpression { expression: String, reason: String },

    #[error("workflow definition {id} not found")]
    DefinitionNotFound { id: Uuid, version: Option<i32> },

    #[error("workflow definition {0} has no active version")]
    NoActiveDefinition(Uuid),

    #[error("workflow instance {0} not found")]
    InstanceNotFound(Uuid),

    /// A node id does not exist in the instance's pinned definition version.
    #[error("node '{0}' not found in workflow definition")]
    NodeNotFound(String),

    #[error("no node-instance recorded for node '{0}'")]
    NodeInstanceNotFound(String),

    #[error("node '{0}' has no outgoing edge")]
    NoOutgoingEdge(String),

    #[error("no edge condition matched leaving node '{0}'")]
    NoMatchingEdge(String),

    #[error("invalid action '{0}'")]
    InvalidAction(String),

    #[error("node '{node_id}' is not pending")]
    NodeNotPending { node_id: String },

    #[error("workflow instance {id} is already {status:?}")]
    InstanceTerminated { id: Uuid, status: InstanceStatus },

    #[error("workflow instance {0} has not been submitted")]
    NotSubmitted(Uuid),

    #[error("workflow instance {0} has already been submitted")]
    AlreadySubmitted(Uuid),

    #[error("payload field '{0}' is required for this action")]
    MissingPayloadField(&'static str),

    /// Another operation holds the instance lock. Safe to retry.
    #[error("could not acquire lock '{key}': concurrent operation in progress")]
    LockAcquisition { key: String },

    #[error("unresolved assignee type '{0}'")]
    UnresolvedAssigneeType(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Lock(LockError),
}

impl WorkflowError {
    /// Stable error code for the request layer.
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::DefinitionInvalid(_) => "DEFINITION_INVALID",
            WorkflowError::UnsafeExpression { .. } => "UNSAFE_EXPRESSION",
            WorkflowError::DefinitionNotFound { .. } => "DEFINITION_NOT_FOUND",
            WorkflowError::NoActiveDefinition(_) => "NO_ACTIVE_DEFINITION",
            WorkflowError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            WorkflowError::NodeNotFound(_) => "NODE_NOT_FOUND",
            WorkflowError::NodeInstanceNotFound(_) => "NODE_INSTANCE_NOT_FOUND",
            WorkflowError::NoOutgoingEdge(_) => "NO_OUTGOING_EDGE",
            WorkflowError::NoMatchingEdge(_) => "NO_MATCHING_EDGE",
            WorkflowError::InvalidAction(_) => "INVALID_ACTION",
            WorkflowError::NodeNotPending { .. } => "NODE_NOT_PENDING",
            WorkflowError::InstanceTerminated { .. } => "INSTANCE_TERMINATED",
            WorkflowError::NotSubmitted(_) => "NOT_SUBMITTED",
            WorkflowError::AlreadySubmitted(_) => "ALREADY_SUBMITTED",
            WorkflowError::MissingPayloadField(_) => "MISSING_PAYLOAD_FIELD",
            WorkflowError::LockAcquisition { .. } => "LOCK_ACQUISITION",
            WorkflowError::UnresolvedAssigneeType(_) => "UNRESOLVED_ASSIGNEE_TYPE",
            WorkflowError::Expression(_) => "EXPRESSION_ERROR",
            WorkflowError::Repository(_) => "REPOSITORY_ERROR",
            WorkflowError::Directory(_) => "DIRECTORY_ERROR",
            WorkflowError::Lock(_) => "LOCK_ERROR",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkflowError::LockAcquisition { .. })
    }
}

impl From<LockError> for WorkflowError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held { key } => WorkflowError::LockAcquisition { key },
            other => WorkflowError::Lock(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_lock_acquisition_is_retryable() {
        let busy = WorkflowError::LockAcquisition {
            key: "wf_lock:@host:x".to_string(),
        };
        assert!(busy.is_retryable());
        assert_eq!(busy.code(), "LOCK_ACQUISITION");

        let missing = WorkflowError::InstanceNotFound(Uuid::nil());
        assert!(!missing.is_retryable());
        assert_eq!(missing.code(), "INSTANCE_NOT_FOUND");
    }

    #[test]
    fn test_held_lock_maps_to_lock_acquisition() {
        let err: WorkflowError = LockError::Held {
            key: "k".to_string(),
        }
        .into();
        assert!(matches!(err, WorkflowError::LockAcquisition { .. }));

        let err: WorkflowError = LockError::Backend("down".to_string()).into();
        assert_eq!(err.code(), "LOCK_ERROR");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_expression_errors_convert() {
        let err: WorkflowError = ExpressionError::Eval("boom".to_string()).into();
        assert_eq!(err.code(), "EXPRESSION_ERROR");
        assert!(err.to_string().contains("boom"));
    }
}
