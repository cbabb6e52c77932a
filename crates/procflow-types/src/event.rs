//! Domain events emitted by the workflow state machine.
//!
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};

use crate::workflow::{InstanceStatus, WorkflowInstance};

/// Events emitted after an action has been applied to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// The initial node-instance was created.
    Submitted { instance: WorkflowInstance },

    /// The instance moved forward to a new node.
    NodeAdvanced { instance: WorkflowInstance },

    /// The instance reached a terminal status.
    Completed {
        instance: WorkflowInstance,
        status: InstanceStatus,
    },

    /// The instance was sent back to an earlier node.
    NodeReturned {
        instance: WorkflowInstance,
        target_node: String,
    },

    /// A pending node was reassigned.
    NodeTransferred {
        instance: WorkflowInstance,
        node_id: String,
        new_assignee_id: String,
    },
}

impl WorkflowEvent {
    /// Dotted event name used by observers (e.g. `workflow.completed`).
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::Submitted { .. } => "workflow.submitted",
            WorkflowEvent::NodeAdvanced { .. } => "node.advanced",
            WorkflowEvent::Completed { .. } => "workflow.completed",
            WorkflowEvent::NodeReturned { .. } => "node.returned",
            WorkflowEvent::NodeTransferred { .. } => "node.transferred",
        }
    }

    /// The instance snapshot the event refers to.
    pub fn instance(&self) -> &WorkflowInstance {
        match self {
            WorkflowEvent::Submitted { instance }
            | WorkflowEvent::NodeAdvanced { instance }
            | WorkflowEvent::Completed { instance, .. }
            | WorkflowEvent::NodeReturned { instance, .. }
            | WorkflowEvent::NodeTransferred { instance, .. } => instance,
        }
    }
}
