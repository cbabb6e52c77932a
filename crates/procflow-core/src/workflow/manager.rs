//! Workflow instance manager.
//!
//! Owns definition lifecycle (create, version, activate) and instance
//! mechanics: initial node creation, node resolution, edge routing,
//! return/transfer and history. It performs no locking; the coordinator
//! serializes calls per instance.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use procflow_types::config::EngineConfig;
use procflow_types::error::RepositoryError;
use procflow_types::tenant::TenantContext;
use procflow_types::workflow::{
    EdgeDefinition, InstanceStatus, NodeDefinition, NodeKind, NodeStatus, WorkflowAction,
    WorkflowConfig, WorkflowDefinition, WorkflowHistory, WorkflowInstance, WorkflowNodeInstance,
};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::assignee::AssigneeResolver;
use super::definition::validate_definition;
use super::error::WorkflowError;
use super::expression::ExpressionEvaluator;
use super::graph::WorkflowGraph;
use crate::repository::directory::UserDirectory;
use crate::repository::workflow::WorkflowRepository;

/// Result of advancing an instance along an edge.
#[derive(Debug, Clone)]
pub enum MoveOutcome {
    /// A new pending node-instance was created at the target node.
    Advanced(WorkflowNodeInstance),
    /// The target was an `end` node; the instance is now APPROVED.
    Completed(WorkflowNodeInstance),
}

/// A move computed by [`InstanceManager::plan_next_node`] or
/// [`InstanceManager::plan_return`]. Holds everything that can fail to
/// look up, so applying it only writes.
#[derive(Debug, Clone)]
pub struct Transition {
    from: String,
    target: NodeDefinition,
    assignees: Vec<String>,
}

impl Transition {
    pub fn from_node(&self) -> &str {
        &self.from
    }

    pub fn target(&self) -> &NodeDefinition {
        &self.target
    }

    pub fn assignees(&self) -> &[String] {
        &self.assignees
    }
}

/// Compiled graphs keyed by (tenant scope, definition id, version).
type GraphCache = DashMap<(String, Uuid, i32), Arc<WorkflowGraph>>;

/// Definition and instance mechanics over a [`WorkflowRepository`].
pub struct InstanceManager<R: WorkflowRepository, D: UserDirectory> {
    repo: Arc<R>,
    resolver: AssigneeResolver<R, D>,
    evaluator: ExpressionEvaluator,
    graphs: GraphCache,
    strict_edge_matching: bool,
}

impl<R: WorkflowRepository, D: UserDirectory> InstanceManager<R, D> {
    pub fn new(repo: Arc<R>, directory: Arc<D>, config: &EngineConfig) -> Self {
        let evaluator = ExpressionEvaluator::from_config(config);
        Self {
            resolver: AssigneeResolver::new(repo.clone(), directory, evaluator.clone()),
            repo,
            evaluator,
            graphs: DashMap::new(),
            strict_edge_matching: config.strict_edge_matching,
        }
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate a definition graph, including every embedded expression.
    pub fn validate_definition(&self, config: &WorkflowConfig) -> Result<WorkflowGraph, WorkflowError> {
        validate_definition(config, &self.evaluator)
    }

    /// Store a brand-new definition (fresh id, version `config.version` or 1).
    ///
    /// The definition starts inactive.
    pub async fn create_definition(
        &self,
        ctx: &TenantContext,
        name: &str,
        description: Option<&str>,
        config: WorkflowConfig,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let graph = self.validate_definition(&config)?;
        let version = config.version.unwrap_or(1);
        let def = WorkflowDefinition {
            id: Uuid::now_v7(),
            tenant_id: ctx.tenant_id.clone(),
            name: name.to_string(),
            description: description.map(str::to_string),
            version,
            config,
            is_active: false,
            created_at: Utc::now(),
        };

        self.repo.insert_definition(ctx, &def).await?;
        self.cache_graph(ctx, &def.id, version, graph);

        tracing::info!(definition_id = %def.id, version, name = %def.name, "workflow definition created");
        Ok(def)
    }

    /// Append version `max + 1` under an existing definition id.
    pub async fn create_definition_version(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
        config: WorkflowConfig,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let graph = self.validate_definition(&config)?;
        let latest = self
            .repo
            .latest_definition_version(ctx, id)
            .await?
            .ok_or(WorkflowError::DefinitionNotFound {
                id: *id,
                version: None,
            })?;
        let previous = self
            .repo
            .get_definition(ctx, id, latest)
            .await?
            .ok_or(WorkflowError::DefinitionNotFound {
                id: *id,
                version: Some(latest),
            })?;

        let def = WorkflowDefinition {
            id: *id,
            tenant_id: ctx.tenant_id.clone(),
            name: previous.name,
            description: previous.description,
            version: latest + 1,
            config,
            is_active: false,
            created_at: Utc::now(),
        };

        self.repo.insert_definition(ctx, &def).await?;
        self.cache_graph(ctx, id, def.version, graph);

        tracing::info!(definition_id = %id, version = def.version, "workflow definition version created");
        Ok(def)
    }

    /// Make `version` the only active version of `id`.
    pub async fn activate_definition_version(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
        version: i32,
    ) -> Result<(), WorkflowError> {
        match self.repo.activate_definition_version(ctx, id, version).await {
            Ok(()) => {
                tracing::info!(definition_id = %id, version, "workflow definition version activated");
                Ok(())
            }
            Err(RepositoryError::NotFound) => Err(WorkflowError::DefinitionNotFound {
                id: *id,
                version: Some(version),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_definition_versions(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        Ok(self.repo.list_definition_versions(ctx, id).await?)
    }

    /// The compiled graph of a pinned definition version.
    pub async fn graph_for(
        &self,
        ctx: &TenantContext,
        definition_id: &Uuid,
        version: i32,
    ) -> Result<Arc<WorkflowGraph>, WorkflowError> {
        let key = (ctx.scope().into_owned(), *definition_id, version);
        if let Some(graph) = self.graphs.get(&key) {
            return Ok(graph.clone());
        }

        let def = self
            .repo
            .get_definition(ctx, definition_id, version)
            .await?
            .ok_or(WorkflowError::DefinitionNotFound {
                id: *definition_id,
                version: Some(version),
            })?;
        let graph = Arc::new(WorkflowGraph::compile(&def.config)?);
        self.graphs.insert(key, graph.clone());
        Ok(graph)
    }

    fn cache_graph(&self, ctx: &TenantContext, id: &Uuid, version: i32, graph: WorkflowGraph) {
        self.graphs
            .insert((ctx.scope().into_owned(), *id, version), Arc::new(graph));
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Create a PENDING instance pinned to the active version of a definition.
    pub async fn start_instance(
        &self,
        ctx: &TenantContext,
        definition_id: &Uuid,
        creator_id: &str,
        form_data: Option<Value>,
        attachments: Vec<String>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let def = self
            .repo
            .get_active_definition(ctx, definition_id)
            .await?
            .ok_or(WorkflowError::NoActiveDefinition(*definition_id))?;

        let now = Utc::now();
        let instance = WorkflowInstance {
            id: Uuid::now_v7(),
            tenant_id: ctx.tenant_id.clone(),
            definition_id: def.id,
            version: def.version,
            creator_id: creator_id.to_string(),
            form_data: form_data.unwrap_or_else(|| Value::Object(Map::new())),
            attachments,
            status: InstanceStatus::Pending,
            current_step: None,
            created_at: now,
            updated_at: now,
        };

        self.repo.create_instance(ctx, &instance).await?;
        tracing::info!(
            instance_id = %instance.id,
            definition_id = %def.id,
            version = def.version,
            "workflow instance started"
        );
        Ok(instance)
    }

    pub async fn get_instance(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Option<WorkflowInstance>, WorkflowError> {
        Ok(self.repo.get_instance(ctx, id).await?)
    }

    /// Persist status and current step, bumping `updated_at`.
    pub async fn save_instance(
        &self,
        ctx: &TenantContext,
        instance: &mut WorkflowInstance,
    ) -> Result<(), WorkflowError> {
        instance.updated_at = Utc::now();
        self.repo.update_instance(ctx, instance).await?;
        Ok(())
    }

    /// Set a terminal status and clear the current step.
    pub async fn complete_instance(
        &self,
        ctx: &TenantContext,
        instance: &mut WorkflowInstance,
        status: InstanceStatus,
    ) -> Result<(), WorkflowError> {
        instance.status = status;
        instance.current_step = None;
        self.save_instance(ctx, instance).await?;
        tracing::info!(instance_id = %instance.id, status = status.as_str(), "workflow instance completed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Node mechanics
    // -----------------------------------------------------------------------

    /// Create the pending node-instance at the start node and point the
    /// instance at it.
    pub async fn create_initial_node(
        &self,
        ctx: &TenantContext,
        instance: &mut WorkflowInstance,
    ) -> Result<WorkflowNodeInstance, WorkflowError> {
        let graph = self.graph_for(ctx, &instance.definition_id, instance.version).await?;
        let start = graph.start_node().ok_or_else(|| {
            WorkflowError::DefinitionInvalid("definition must have a start node".to_string())
        })?;

        let assignees = self.resolve_assignees(ctx, instance, start).await?;
        let node = self.create_pending_node(ctx, instance, start, assignees).await?;
        instance.current_step = Some(start.id.clone());
        self.save_instance(ctx, instance).await?;
        Ok(node)
    }

    /// Record the resolution of the most recent node-instance of the
    /// current step.
    pub async fn update_current_node(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
        status: NodeStatus,
        comment: Option<&str>,
    ) -> Result<WorkflowNodeInstance, WorkflowError> {
        let current = current_step(instance)?;
        let mut node = self
            .repo
            .latest_node_instance_for(ctx, &instance.id, current)
            .await?
            .ok_or_else(|| WorkflowError::NodeInstanceNotFound(current.to_string()))?;

        node.status = status;
        node.comments = comment.map(str::to_string);
        node.resolved_at = Some(Utc::now());
        self.repo.update_node_instance(ctx, &node).await?;

        tracing::debug!(
            instance_id = %instance.id,
            node_id = %current,
            status = status.as_str(),
            "node resolved"
        );
        Ok(node)
    }

    /// True iff the current step has no outgoing edges or every outgoing
    /// edge targets an `end` node.
    pub async fn is_last_node(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
    ) -> Result<bool, WorkflowError> {
        let current = current_step(instance)?;
        let graph = self.graph_for(ctx, &instance.definition_id, instance.version).await?;
        Ok(graph.is_last_node(current))
    }

    /// Follow one outgoing edge of the current step.
    ///
    /// Equivalent to [`plan_next_node`](Self::plan_next_node) followed by
    /// [`apply_move`](Self::apply_move).
    pub async fn move_to_next_node(
        &self,
        ctx: &TenantContext,
        instance: &mut WorkflowInstance,
        operator_id: &str,
    ) -> Result<MoveOutcome, WorkflowError> {
        let transition = self.plan_next_node(ctx, instance, operator_id).await?;
        self.apply_move(ctx, instance, transition, operator_id).await
    }

    /// Pick the next node and resolve its assignees without writing.
    ///
    /// Conditional edges are tried in declared order and the first truthy one
    /// wins; an edge whose evaluation fails counts as a non-match. Without a
    /// match the first unconditional edge is taken, else the first edge
    /// (unless strict matching is configured).
    pub async fn plan_next_node(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
        operator_id: &str,
    ) -> Result<Transition, WorkflowError> {
        let current = current_step(instance)?.to_string();
        let graph = self.graph_for(ctx, &instance.definition_id, instance.version).await?;
        let edges = graph.outgoing(&current);
        if edges.is_empty() {
            return Err(WorkflowError::NoOutgoingEdge(current));
        }

        let context = routing_context(instance, operator_id, &current);
        let edge = self.select_edge(instance, &current, edges, &context)?;
        let target = graph
            .node(&edge.target)
            .ok_or_else(|| WorkflowError::NodeNotFound(edge.target.clone()))?;

        tracing::debug!(
            instance_id = %instance.id,
            from = %current,
            to = %target.id,
            conditional = edge.condition().is_some(),
            "edge selected"
        );

        let assignees = if target.kind == NodeKind::End {
            vec![]
        } else {
            self.resolve_assignees(ctx, instance, target).await?
        };
        Ok(Transition {
            from: current,
            target: target.clone(),
            assignees,
        })
    }

    /// Persist a planned move. Reaching an `end` node completes the instance.
    pub async fn apply_move(
        &self,
        ctx: &TenantContext,
        instance: &mut WorkflowInstance,
        transition: Transition,
        operator_id: &str,
    ) -> Result<MoveOutcome, WorkflowError> {
        let Transition {
            from,
            target,
            assignees,
        } = transition;

        let outcome = if target.kind == NodeKind::End {
            let now = Utc::now();
            let node = WorkflowNodeInstance {
                id: Uuid::now_v7(),
                instance_id: instance.id,
                node_id: target.id.clone(),
                status: NodeStatus::Approved,
                assignees: vec![],
                comments: None,
                resolved_at: Some(now),
                created_at: now,
            };
            self.repo.create_node_instance(ctx, &node).await?;
            self.complete_instance(ctx, instance, InstanceStatus::Approved).await?;
            MoveOutcome::Completed(node)
        } else {
            let node = self.create_pending_node(ctx, instance, &target, assignees).await?;
            instance.current_step = Some(target.id.clone());
            self.save_instance(ctx, instance).await?;
            MoveOutcome::Advanced(node)
        };

        self.log_history(
            ctx,
            &instance.id,
            WorkflowAction::Submit,
            operator_id,
            Some(format!("moved to: {}", display_name(&target))),
            Some(json!({"from": from, "to": target.id})),
        )
        .await?;

        Ok(outcome)
    }

    fn select_edge<'g>(
        &self,
        instance: &WorkflowInstance,
        current: &str,
        edges: &'g [EdgeDefinition],
        context: &Map<String, Value>,
    ) -> Result<&'g EdgeDefinition, WorkflowError> {
        for edge in edges {
            let Some(condition) = edge.condition() else {
                continue;
            };
            match self.evaluator.evaluate_bool(condition, context) {
                Ok(true) => return Ok(edge),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        instance_id = %instance.id,
                        edge_target = %edge.target,
                        condition,
                        error = %e,
                        "edge condition failed, treating as non-match"
                    );
                }
            }
        }

        if let Some(edge) = edges.iter().find(|e| e.condition().is_none()) {
            return Ok(edge);
        }
        if self.strict_edge_matching {
            return Err(WorkflowError::NoMatchingEdge(current.to_string()));
        }
        tracing::warn!(
            instance_id = %instance.id,
            node_id = %current,
            "no edge condition matched, falling back to first declared edge"
        );
        Ok(&edges[0])
    }

    /// Ensure a node exists in the instance's pinned version.
    pub async fn require_node(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
        node_id: &str,
    ) -> Result<NodeDefinition, WorkflowError> {
        let graph = self.graph_for(ctx, &instance.definition_id, instance.version).await?;
        graph
            .node(node_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))
    }

    /// Send the instance back to `target_node` with a fresh pending
    /// node-instance. Earlier visits are left untouched.
    pub async fn return_to_node(
        &self,
        ctx: &TenantContext,
        instance: &mut WorkflowInstance,
        target_node: &str,
    ) -> Result<WorkflowNodeInstance, WorkflowError> {
        let transition = self.plan_return(ctx, instance, target_node).await?;
        self.apply_return(ctx, instance, transition).await
    }

    /// Look up `target_node` and resolve its assignees without writing.
    pub async fn plan_return(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
        target_node: &str,
    ) -> Result<Transition, WorkflowError> {
        let from = current_step(instance)?.to_string();
        let target = self.require_node(ctx, instance, target_node).await?;
        let assignees = self.resolve_assignees(ctx, instance, &target).await?;
        Ok(Transition {
            from,
            target,
            assignees,
        })
    }

    /// Persist a planned return.
    pub async fn apply_return(
        &self,
        ctx: &TenantContext,
        instance: &mut WorkflowInstance,
        transition: Transition,
    ) -> Result<WorkflowNodeInstance, WorkflowError> {
        let Transition {
            target, assignees, ..
        } = transition;
        let node = self.create_pending_node(ctx, instance, &target, assignees).await?;
        instance.current_step = Some(target.id.clone());
        self.save_instance(ctx, instance).await?;

        tracing::debug!(instance_id = %instance.id, node_id = %target.id, "instance returned to node");
        Ok(node)
    }

    /// Replace the assignees of the most recent visit to `node_id`.
    pub async fn transfer_assignee(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
        node_id: &str,
        new_assignee_id: &str,
    ) -> Result<WorkflowNodeInstance, WorkflowError> {
        let mut node = self
            .repo
            .latest_node_instance_for(ctx, &instance.id, node_id)
            .await?
            .ok_or_else(|| WorkflowError::NodeInstanceNotFound(node_id.to_string()))?;

        if node.status != NodeStatus::Pending {
            return Err(WorkflowError::NodeNotPending {
                node_id: node_id.to_string(),
            });
        }

        node.assignees = vec![new_assignee_id.to_string()];
        self.repo.update_node_instance(ctx, &node).await?;
        Ok(node)
    }

    pub async fn log_history(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
        action: WorkflowAction,
        operator_id: &str,
        comment: Option<String>,
        data: Option<Value>,
    ) -> Result<WorkflowHistory, WorkflowError> {
        let entry = WorkflowHistory {
            id: Uuid::now_v7(),
            instance_id: *instance_id,
            action,
            operator_id: operator_id.to_string(),
            comment,
            data,
            created_at: Utc::now(),
        };
        self.repo.append_history(ctx, &entry).await?;
        Ok(entry)
    }

    pub async fn list_node_instances(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Vec<WorkflowNodeInstance>, WorkflowError> {
        Ok(self.repo.list_node_instances(ctx, instance_id).await?)
    }

    pub async fn list_history(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Vec<WorkflowHistory>, WorkflowError> {
        Ok(self.repo.list_history(ctx, instance_id).await?)
    }

    async fn resolve_assignees(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
        node: &NodeDefinition,
    ) -> Result<Vec<String>, WorkflowError> {
        self.resolver
            .resolve(ctx, node.assignee_resolver.as_ref(), instance, node)
            .await
    }

    async fn create_pending_node(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
        node: &NodeDefinition,
        assignees: Vec<String>,
    ) -> Result<WorkflowNodeInstance, WorkflowError> {
        let row = WorkflowNodeInstance {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            node_id: node.id.clone(),
            status: NodeStatus::Pending,
            assignees,
            comments: None,
            resolved_at: None,
            created_at: Utc::now(),
        };
        self.repo.create_node_instance(ctx, &row).await?;
        Ok(row)
    }
}

fn current_step(instance: &WorkflowInstance) -> Result<&str, WorkflowError> {
    instance
        .current_step
        .as_deref()
        .ok_or(WorkflowError::NotSubmitted(instance.id))
}

fn display_name(node: &NodeDefinition) -> &str {
    if node.name.is_empty() { &node.id } else { &node.name }
}

/// Form fields plus `$creator`, `$currentUser`, `$currentStep` and `$currentTime`.
fn routing_context(
    instance: &WorkflowInstance,
    operator_id: &str,
    current: &str,
) -> Map<String, Value> {
    let mut context = instance.form_fields();
    context.insert("$creator".to_string(), Value::String(instance.creator_id.clone()));
    context.insert("$currentUser".to_string(), Value::String(operator_id.to_string()));
    context.insert("$currentStep".to_string(), Value::String(current.to_string()));
    context.insert(
        "$currentTime".to_string(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    context
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
