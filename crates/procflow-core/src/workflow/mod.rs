//! Workflow engine core.
//!
//! - `expression` -- sandboxed evaluator for edge and assignee conditions
//! - `graph` -- compiled node/edge graph with routing lookups
//! - `definition` -- YAML conversion and definition-time validation
//! - `assignee` -- resolves node assignee specs to principal ids
//! - `manager` -- definition lifecycle and instance/node mechanics
//! - `coordinator` -- lock-guarded action state machine (the public facade)
//! - `error` -- business errors with stable codes

pub mod assignee;
pub mod coordinator;
pub mod definition;
pub mod error;
pub mod expression;
pub mod graph;
pub mod manager;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::WorkflowCoordinator;
pub use error::WorkflowError;
pub use expression::{ExpressionError, ExpressionEvaluator};
pub use manager::{InstanceManager, MoveOutcome};
