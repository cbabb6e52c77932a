//! Workflow domain types for procflow.
//!
//! Defines versioned process definitions (a node/edge graph), running
//! instances, per-visit node-instances, and the append-only action history.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Definition graph
// ---------------------------------------------------------------------------

/// The node/edge graph of a process definition.
///
/// Parsed once when the definition is authored; instances only ever see the
/// validated form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Requested version number for a brand-new definition (defaults to 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    /// Graph nodes. Must contain at least one `start` and one `end` node.
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    /// Directed edges; declared order is significant for routing.
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

/// A single node in the process graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Node ID, unique within a definition (e.g. "manager-review").
    pub id: String,
    /// The kind of node.
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Human-readable node name.
    #[serde(default)]
    pub name: String,
    /// How the node's handlers are resolved.
    #[serde(
        default,
        alias = "assigneeResolver",
        skip_serializing_if = "Option::is_none"
    )]
    pub assignee_resolver: Option<AssigneeSpec>,
    /// Static assignees used when no resolver is configured.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignees: Vec<String>,
    /// Any further node configuration, kept verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// The kind of node in a process graph.
///
/// Only `start` and `end` carry routing meaning. Any other type string
/// (e.g. `notify`) deserializes as [`NodeKind::Other`] and behaves like a
/// task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    Task,
    Approval,
    End,
    #[serde(other)]
    Other,
}

/// Assignee resolution rule attached to a node.
///
/// Either the compact string form `"type:value"` (e.g. `"role:manager"`,
/// `"creator:"`) or an object with an optional candidate filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssigneeSpec {
    Expression(String),
    Rule(AssigneeRule),
}

/// Object form of an assignee rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssigneeRule {
    /// Resolver type: `user`, `role`, `creator` or `previous`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: String,
    /// Per-candidate filter; `$assignee` is bound to the candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub source: String,
    pub target: String,
    /// Boolean expression gating traversal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl EdgeDefinition {
    /// The edge condition, treating an empty string as no condition.
    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref().filter(|c| !c.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// One version of a process definition.
///
/// `(id, version)` identifies a row; at most one version per `id` is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Shared by every version of the same process.
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: i32,
    pub config: WorkflowConfig,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Pending,
    Approved,
    Rejected,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Approved | InstanceStatus::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "PENDING",
            InstanceStatus::Approved => "APPROVED",
            InstanceStatus::Rejected => "REJECTED",
        }
    }
}

/// One running or completed execution of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub definition_id: Uuid,
    /// Definition version pinned at creation; never changes afterwards.
    pub version: i32,
    pub creator_id: String,
    /// Submitted form fields (a JSON object).
    pub form_data: Value,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub status: InstanceStatus,
    /// Node the instance is waiting on. `None` before SUBMIT and once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Form data as a flat field map.
    ///
    /// Accepts an object, or a string holding a JSON object; anything else
    /// yields an empty map.
    pub fn form_fields(&self) -> Map<String, Value> {
        match &self.form_data {
            Value::Object(map) => map.clone(),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            },
            _ => Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Node instance
// ---------------------------------------------------------------------------

/// Resolution status of a node-instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Approved,
    Rejected,
    Returned,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "PENDING",
            NodeStatus::Approved => "APPROVED",
            NodeStatus::Rejected => "REJECTED",
            NodeStatus::Returned => "RETURNED",
        }
    }
}

/// The record of one visit to one graph node.
///
/// Rows are append-only: revisiting a node creates a new row. A row is only
/// updated in place to record its own resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNodeInstance {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub status: NodeStatus,
    pub assignees: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Actions and history
// ---------------------------------------------------------------------------

/// The exhaustive set of actions an instance accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowAction {
    Submit,
    Approve,
    Reject,
    Return,
    Transfer,
}

impl WorkflowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowAction::Submit => "SUBMIT",
            WorkflowAction::Approve => "APPROVE",
            WorkflowAction::Reject => "REJECT",
            WorkflowAction::Return => "RETURN",
            WorkflowAction::Transfer => "TRANSFER",
        }
    }
}

impl fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when an action name is not one of the known actions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown workflow action: '{0}'")]
pub struct UnknownAction(pub String);

impl FromStr for WorkflowAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUBMIT" => Ok(WorkflowAction::Submit),
            "APPROVE" => Ok(WorkflowAction::Approve),
            "REJECT" => Ok(WorkflowAction::Reject),
            "RETURN" => Ok(WorkflowAction::Return),
            "TRANSFER" => Ok(WorkflowAction::Transfer),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

/// Action-specific request fields. `operator_id` is always present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionPayload {
    #[serde(alias = "operatorId")]
    pub operator_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// RETURN: node to go back to.
    #[serde(default, alias = "targetNode", skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,
    /// TRANSFER: node whose pending visit is reassigned.
    #[serde(default, alias = "nodeId", skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// TRANSFER: principal receiving the node.
    #[serde(default, alias = "newAssigneeId", skip_serializing_if = "Option::is_none")]
    pub new_assignee_id: Option<String>,
}

impl ActionPayload {
    pub fn new(operator_id: impl Into<String>) -> Self {
        Self {
            operator_id: operator_id.into(),
            ..Self::default()
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Append-only audit record of one action on an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowHistory {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub action: WorkflowAction,
    pub operator_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
}
