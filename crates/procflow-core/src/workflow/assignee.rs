//! Assignee resolution: turns a node's assignee spec into principal ids.
//!
//! String specs have the form `"type:value"`:
//! - `user:<id>`     -> `[id]`
//! - `role:<name>`   -> every principal holding the role (user directory)
//! - `creator:`      -> `[instance.creator_id]`
//! - `previous:`     -> assignees of the most recent node-instance, or the creator
//!
//! Object specs resolve the same way and then keep only candidates for which
//! `condition` is truthy with `$assignee` bound to the candidate.

use std::sync::Arc;

use procflow_types::tenant::TenantContext;
use procflow_types::workflow::{AssigneeSpec, NodeDefinition, WorkflowInstance};
use serde_json::{Map, Value};

use super::error::WorkflowError;
use super::expression::ExpressionEvaluator;
use crate::repository::directory::UserDirectory;
use crate::repository::workflow::WorkflowRepository;

/// Resolver types accepted in an assignee spec.
pub const ASSIGNEE_TYPES: &[&str] = &["user", "role", "creator", "previous"];

/// The resolver type named by `spec`, trimmed.
pub fn spec_kind(spec: &AssigneeSpec) -> &str {
    match spec {
        AssigneeSpec::Expression(expr) => split_expression(expr).0,
        AssigneeSpec::Rule(rule) => rule.kind.trim(),
    }
}

fn split_expression(expr: &str) -> (&str, &str) {
    let (kind, value) = expr.split_once(':').unwrap_or((expr, ""));
    (kind.trim(), value.trim())
}

/// Resolves node assignees against the repository and user directory.
pub struct AssigneeResolver<R: WorkflowRepository, D: UserDirectory> {
    repo: Arc<R>,
    directory: Arc<D>,
    evaluator: ExpressionEvaluator,
}

impl<R: WorkflowRepository, D: UserDirectory> AssigneeResolver<R, D> {
    pub fn new(repo: Arc<R>, directory: Arc<D>, evaluator: ExpressionEvaluator) -> Self {
        Self {
            repo,
            directory,
            evaluator,
        }
    }

    /// Resolve `spec` for `instance`. With no spec, the node's static
    /// `assignees` are used.
    pub async fn resolve(
        &self,
        ctx: &TenantContext,
        spec: Option<&AssigneeSpec>,
        instance: &WorkflowInstance,
        node: &NodeDefinition,
    ) -> Result<Vec<String>, WorkflowError> {
        match spec {
            None => Ok(node.assignees.clone()),
            Some(AssigneeSpec::Expression(expr)) => {
                let (kind, value) = split_expression(expr);
                self.resolve_rule(ctx, kind, value, instance).await
            }
            Some(AssigneeSpec::Rule(rule)) => {
                let candidates = self
                    .resolve_rule(ctx, rule.kind.trim(), rule.value.trim(), instance)
                    .await?;
                match rule.condition.as_deref().filter(|c| !c.trim().is_empty()) {
                    Some(condition) => Ok(self.filter_candidates(candidates, condition, instance)),
                    None => Ok(candidates),
                }
            }
        }
    }

    async fn resolve_rule(
        &self,
        ctx: &TenantContext,
        kind: &str,
        value: &str,
        instance: &WorkflowInstance,
    ) -> Result<Vec<String>, WorkflowError> {
        match kind {
            "user" => Ok(if value.is_empty() {
                vec![]
            } else {
                vec![value.to_string()]
            }),
            "role" => Ok(self.directory.find_users_by_role(ctx, value).await?),
            "creator" => Ok(vec![instance.creator_id.clone()]),
            "previous" => {
                let latest = self.repo.latest_node_instance(ctx, &instance.id).await?;
                Ok(match latest {
                    Some(node) => node.assignees,
                    None => vec![instance.creator_id.clone()],
                })
            }
            other => Err(WorkflowError::UnresolvedAssigneeType(other.to_string())),
        }
    }

    /// Keep candidates whose condition evaluates truthy. A candidate whose
    /// evaluation fails is dropped; the rest are still considered.
    fn filter_candidates(
        &self,
        candidates: Vec<String>,
        condition: &str,
        instance: &WorkflowInstance,
    ) -> Vec<String> {
        let base = filter_context(instance);

        candidates
            .into_iter()
            .filter(|candidate| {
                let mut context = base.clone();
                context.insert("$assignee".to_string(), Value::String(candidate.clone()));
                match self.evaluator.evaluate_bool(condition, &context) {
                    Ok(keep) => keep,
                    Err(e) => {
                        tracing::warn!(
                            instance_id = %instance.id,
                            candidate = %candidate,
                            error = %e,
                            "assignee condition failed, excluding candidate"
                        );
                        false
                    }
                }
            })
            .collect()
    }
}

fn filter_context(instance: &WorkflowInstance) -> Map<String, Value> {
    let mut context = instance.form_fields();
    context.insert(
        "$tenant".to_string(),
        instance
            .tenant_id
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    context.insert(
        "$creator".to_string(),
        Value::String(instance.creator_id.clone()),
    );
    context
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
