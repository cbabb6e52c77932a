//! Definition authoring: YAML conversion and full validation.
//!
//! Structural checks live in [`WorkflowGraph::compile`]; this module adds the
//! expression checks that must pass before a definition is stored. Routing
//! and assignee conditions are validated here once, so runtime evaluation
//! never sees an expression that failed validation.

use procflow_types::workflow::{AssigneeSpec, WorkflowConfig};

use super::assignee::{ASSIGNEE_TYPES, spec_kind};
use super::error::WorkflowError;
use super::expression::ExpressionEvaluator;
use super::graph::WorkflowGraph;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document into a `WorkflowConfig`.
///
/// Only deserializes; call [`validate_definition`] before storing it.
pub fn parse_config_yaml(yaml: &str) -> Result<WorkflowConfig, WorkflowError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::DefinitionInvalid(e.to_string()))
}

/// Serialize a `WorkflowConfig` to a YAML string.
pub fn serialize_config_yaml(config: &WorkflowConfig) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(config).map_err(|e| WorkflowError::DefinitionInvalid(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition graph and compile it.
///
/// Checks:
/// - Structural constraints (see [`WorkflowGraph::compile`])
/// - Every edge condition passes `ExpressionEvaluator::validate`
/// - Every assignee spec names a known resolver type
/// - Every object-form assignee condition passes `ExpressionEvaluator::validate`
///
/// Nodes unreachable from a start node are logged, not rejected.
pub fn validate_definition(
    config: &WorkflowConfig,
    evaluator: &ExpressionEvaluator,
) -> Result<WorkflowGraph, WorkflowError> {
    let graph = WorkflowGraph::compile(config)?;

    for edge in &config.edges {
        if let Some(condition) = edge.condition() {
            check_expression(evaluator, condition)?;
        }
    }

    for node in &config.nodes {
        if let Some(spec) = &node.assignee_resolver {
            let kind = spec_kind(spec);
            if !ASSIGNEE_TYPES.contains(&kind) {
                return Err(WorkflowError::DefinitionInvalid(format!(
                    "node '{}' has unknown assignee type '{kind}'",
                    node.id
                )));
            }
        }
        if let Some(AssigneeSpec::Rule(rule)) = &node.assignee_resolver {
            if let Some(condition) = rule.condition.as_deref().filter(|c| !c.trim().is_empty()) {
                check_expression(evaluator, condition)?;
            }
        }
    }

    let unreachable = graph.unreachable_nodes();
    if !unreachable.is_empty() {
        tracing::warn!(nodes = ?unreachable, "definition contains nodes unreachable from start");
    }

    Ok(graph)
}

fn check_expression(evaluator: &ExpressionEvaluator, expression: &str) -> Result<(), WorkflowError> {
    evaluator
        .check(expression)
        .map_err(|e| WorkflowError::UnsafeExpression {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
