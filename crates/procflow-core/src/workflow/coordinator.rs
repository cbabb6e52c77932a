//! Workflow state-machine coordinator.
//!
//! The upward-facing facade of the engine. `process_action` takes the
//! per-instance lock before any read, dispatches exactly one action handler,
//! and releases the lock whatever the handler returned. Events are emitted
//! after the handler's mutations are persisted.

use std::sync::Arc;

use procflow_types::config::EngineConfig;
use procflow_types::error::LockError;
use procflow_types::event::WorkflowEvent;
use procflow_types::tenant::TenantContext;
use procflow_types::workflow::{
    ActionPayload, InstanceStatus, NodeStatus, WorkflowAction, WorkflowConfig, WorkflowDefinition,
    WorkflowHistory, WorkflowInstance, WorkflowNodeInstance,
};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use super::error::WorkflowError;
use super::manager::{InstanceManager, MoveOutcome};
use crate::event::EventSink;
use crate::lock::{DistributedLock, LockToken, definition_lock_key, instance_lock_key};
use crate::repository::directory::UserDirectory;
use crate::repository::workflow::WorkflowRepository;

/// Serializes actions per instance and drives the state machine.
pub struct WorkflowCoordinator<R, D, L, E>
where
    R: WorkflowRepository,
    D: UserDirectory,
    L: DistributedLock,
    E: EventSink,
{
    manager: InstanceManager<R, D>,
    lock: Arc<L>,
    events: Arc<E>,
    config: EngineConfig,
}

impl<R, D, L, E> WorkflowCoordinator<R, D, L, E>
where
    R: WorkflowRepository,
    D: UserDirectory,
    L: DistributedLock,
    E: EventSink,
{
    pub fn new(
        repo: Arc<R>,
        directory: Arc<D>,
        lock: Arc<L>,
        events: Arc<E>,
        config: EngineConfig,
    ) -> Self {
        Self {
            manager: InstanceManager::new(repo, directory, &config),
            lock,
            events,
            config,
        }
    }

    pub fn manager(&self) -> &InstanceManager<R, D> {
        &self.manager
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    pub async fn create_definition(
        &self,
        ctx: &TenantContext,
        name: &str,
        description: Option<&str>,
        config: WorkflowConfig,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        self.manager
            .create_definition(ctx, name, description, config)
            .await
    }

    pub async fn create_definition_version(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
        config: WorkflowConfig,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        self.manager.create_definition_version(ctx, id, config).await
    }

    /// Activate one version, serialized per definition id.
    pub async fn activate_definition_version(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
        version: i32,
    ) -> Result<(), WorkflowError> {
        let lease = self.acquire(&definition_lock_key(ctx, id)).await?;
        let result = self
            .manager
            .activate_definition_version(ctx, id, version)
            .await;
        lease.release().await;
        result
    }

    pub async fn list_definition_versions(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        self.manager.list_definition_versions(ctx, id).await
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    pub async fn start_instance(
        &self,
        ctx: &TenantContext,
        definition_id: &Uuid,
        creator_id: &str,
        form_data: Option<Value>,
        attachments: Vec<String>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        self.manager
            .start_instance(ctx, definition_id, creator_id, form_data, attachments)
            .await
    }

    pub async fn get_workflow_instance(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Option<WorkflowInstance>, WorkflowError> {
        self.manager.get_instance(ctx, instance_id).await
    }

    pub async fn list_node_instances(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Vec<WorkflowNodeInstance>, WorkflowError> {
        self.manager.list_node_instances(ctx, instance_id).await
    }

    pub async fn list_history(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Vec<WorkflowHistory>, WorkflowError> {
        self.manager.list_history(ctx, instance_id).await
    }

    /// Apply one action to an instance under its lock.
    ///
    /// Returns the instance as persisted when the handler finished. Fails
    /// with the retryable [`WorkflowError::LockAcquisition`] while another
    /// action on the same instance is in flight.
    ///
    /// A payload without an operator id is attributed to `ctx.user_id`.
    pub async fn process_action(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
        action: &str,
        mut payload: ActionPayload,
    ) -> Result<WorkflowInstance, WorkflowError> {
        if payload.operator_id.trim().is_empty() {
            if let Some(user_id) = &ctx.user_id {
                payload.operator_id = user_id.clone();
            }
        }

        let lease = self.acquire(&instance_lock_key(ctx, instance_id)).await?;
        let result = self.dispatch(ctx, instance_id, action, &payload).await;
        lease.release().await;

        match &result {
            Ok(instance) => tracing::info!(
                instance_id = %instance_id,
                action,
                operator_id = %payload.operator_id,
                status = instance.status.as_str(),
                "workflow action processed"
            ),
            Err(e) => tracing::info!(
                instance_id = %instance_id,
                action,
                operator_id = %payload.operator_id,
                code = e.code(),
                error = %e,
                "workflow action failed"
            ),
        }
        result
    }

    async fn dispatch(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
        action: &str,
        payload: &ActionPayload,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let mut instance = self
            .manager
            .get_instance(ctx, instance_id)
            .await?
            .ok_or(WorkflowError::InstanceNotFound(*instance_id))?;

        let action: WorkflowAction = action
            .parse()
            .map_err(|e: procflow_types::workflow::UnknownAction| {
                WorkflowError::InvalidAction(e.0)
            })?;

        if instance.status.is_terminal() {
            return Err(WorkflowError::InstanceTerminated {
                id: instance.id,
                status: instance.status,
            });
        }

        match (action, instance.current_step.is_some()) {
            (WorkflowAction::Submit, true) => {
                return Err(WorkflowError::AlreadySubmitted(instance.id));
            }
            (WorkflowAction::Submit, false) => {}
            (_, false) => return Err(WorkflowError::NotSubmitted(instance.id)),
            (_, true) => {}
        }

        match action {
            WorkflowAction::Submit => self.handle_submit(ctx, &mut instance, payload).await?,
            WorkflowAction::Approve => self.handle_approve(ctx, &mut instance, payload).await?,
            WorkflowAction::Reject => self.handle_reject(ctx, &mut instance, payload).await?,
            WorkflowAction::Return => self.handle_return(ctx, &mut instance, payload).await?,
            WorkflowAction::Transfer => self.handle_transfer(ctx, &instance, payload).await?,
        }

        self.manager
            .get_instance(ctx, instance_id)
            .await?
            .ok_or(WorkflowError::InstanceNotFound(*instance_id))
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    async fn handle_submit(
        &self,
        ctx: &TenantContext,
        instance: &mut WorkflowInstance,
        payload: &ActionPayload,
    ) -> Result<(), WorkflowError> {
        self.manager.create_initial_node(ctx, instance).await?;
        self.manager
            .log_history(
                ctx,
                &instance.id,
                WorkflowAction::Submit,
                &payload.operator_id,
                Some(comment_or(payload, "submitted")),
                None,
            )
            .await?;

        self.events.emit(WorkflowEvent::Submitted {
            instance: instance.clone(),
        });
        Ok(())
    }

    async fn handle_approve(
        &self,
        ctx: &TenantContext,
        instance: &mut WorkflowInstance,
        payload: &ActionPayload,
    ) -> Result<(), WorkflowError> {
        // Routing and assignee lookups run before the first write.
        let transition = if self.manager.is_last_node(ctx, instance).await? {
            None
        } else {
            Some(
                self.manager
                    .plan_next_node(ctx, instance, &payload.operator_id)
                    .await?,
            )
        };

        self.manager
            .update_current_node(ctx, instance, NodeStatus::Approved, payload.comment.as_deref())
            .await?;
        self.manager
            .log_history(
                ctx,
                &instance.id,
                WorkflowAction::Approve,
                &payload.operator_id,
                Some(comment_or(payload, "approved")),
                None,
            )
            .await?;

        let Some(transition) = transition else {
            self.manager
                .complete_instance(ctx, instance, InstanceStatus::Approved)
                .await?;
            self.emit_completed(instance);
            return Ok(());
        };

        match self
            .manager
            .apply_move(ctx, instance, transition, &payload.operator_id)
            .await?
        {
            MoveOutcome::Advanced(_) => self.events.emit(WorkflowEvent::NodeAdvanced {
                instance: instance.clone(),
            }),
            MoveOutcome::Completed(_) => self.emit_completed(instance),
        }
        Ok(())
    }

    async fn handle_reject(
        &self,
        ctx: &TenantContext,
        instance: &mut WorkflowInstance,
        payload: &ActionPayload,
    ) -> Result<(), WorkflowError> {
        self.manager
            .update_current_node(ctx, instance, NodeStatus::Rejected, payload.comment.as_deref())
            .await?;
        self.manager
            .log_history(
                ctx,
                &instance.id,
                WorkflowAction::Reject,
                &payload.operator_id,
                Some(comment_or(payload, "rejected")),
                None,
            )
            .await?;

        self.manager
            .complete_instance(ctx, instance, InstanceStatus::Rejected)
            .await?;
        self.emit_completed(instance);
        Ok(())
    }

    async fn handle_return(
        &self,
        ctx: &TenantContext,
        instance: &mut WorkflowInstance,
        payload: &ActionPayload,
    ) -> Result<(), WorkflowError> {
        let target = payload
            .target_node
            .as_deref()
            .ok_or(WorkflowError::MissingPayloadField("targetNode"))?;
        let transition = self.manager.plan_return(ctx, instance, target).await?;

        self.manager
            .update_current_node(ctx, instance, NodeStatus::Returned, payload.comment.as_deref())
            .await?;
        self.manager
            .log_history(
                ctx,
                &instance.id,
                WorkflowAction::Return,
                &payload.operator_id,
                Some(comment_or(payload, &format!("returned to node: {target}"))),
                None,
            )
            .await?;
        self.manager.apply_return(ctx, instance, transition).await?;

        self.events.emit(WorkflowEvent::NodeReturned {
            instance: instance.clone(),
            target_node: target.to_string(),
        });
        Ok(())
    }

    async fn handle_transfer(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
        payload: &ActionPayload,
    ) -> Result<(), WorkflowError> {
        let new_assignee = payload
            .new_assignee_id
            .as_deref()
            .ok_or(WorkflowError::MissingPayloadField("newAssigneeId"))?;
        let node_id = payload
            .node_id
            .as_deref()
            .or(instance.current_step.as_deref())
            .ok_or(WorkflowError::MissingPayloadField("nodeId"))?;

        self.manager
            .transfer_assignee(ctx, instance, node_id, new_assignee)
            .await?;
        self.manager
            .log_history(
                ctx,
                &instance.id,
                WorkflowAction::Transfer,
                &payload.operator_id,
                Some(comment_or(payload, &format!("transferred to: {new_assignee}"))),
                None,
            )
            .await?;

        self.events.emit(WorkflowEvent::NodeTransferred {
            instance: instance.clone(),
            node_id: node_id.to_string(),
            new_assignee_id: new_assignee.to_string(),
        });
        Ok(())
    }

    fn emit_completed(&self, instance: &WorkflowInstance) {
        self.events.emit(WorkflowEvent::Completed {
            instance: instance.clone(),
            status: instance.status,
        });
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    /// Take the lease on `key`, retrying while it is held until the
    /// configured acquire timeout (a single attempt by default).
    async fn acquire(&self, key: &str) -> Result<Lease<L>, WorkflowError> {
        let deadline = Instant::now() + self.config.lock_acquire_timeout();
        loop {
            match self.lock.lock(key, self.config.lock_ttl()).await {
                Ok(token) => {
                    tracing::debug!(lock_key = %key, "lock acquired");
                    return Ok(Lease {
                        lock: self.lock.clone(),
                        token: Some(token),
                    });
                }
                Err(LockError::Held { key }) => {
                    if Instant::now() >= deadline {
                        tracing::debug!(lock_key = %key, "lock busy");
                        return Err(WorkflowError::LockAcquisition { key });
                    }
                    tokio::time::sleep(self.config.lock_retry_interval()).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// A held lease. Released explicitly on the normal path; if the owning
/// future is dropped first, the release is spawned onto the runtime.
struct Lease<L: DistributedLock> {
    lock: Arc<L>,
    token: Option<LockToken>,
}

impl<L: DistributedLock> Lease<L> {
    async fn release(mut self) {
        if let Some(token) = self.token.take() {
            release_token(self.lock.as_ref(), &token).await;
        }
    }
}

impl<L: DistributedLock> Drop for Lease<L> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(lock_key = %token.key, "no runtime to release lock, lease will expire");
            return;
        };
        tracing::debug!(lock_key = %token.key, "action cancelled, releasing lock in background");
        let lock = self.lock.clone();
        handle.spawn(async move {
            release_token(lock.as_ref(), &token).await;
        });
    }
}

async fn release_token<L: DistributedLock>(lock: &L, token: &LockToken) {
    match lock.unlock(token).await {
        Ok(()) => tracing::debug!(lock_key = %token.key, "lock released"),
        Err(e) => tracing::warn!(
            lock_key = %token.key,
            error = %e,
            "failed to release lock, lease will expire"
        ),
    }
}

fn comment_or(payload: &ActionPayload, default: &str) -> String {
    payload
        .comment
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::test_support::{
        MockDirectory, MockLock, MockRepository, RecordingSink, expense_config,
    };
    use chrono::Utc;
    use procflow_types::error::DirectoryError;
    use procflow_types::workflow::AssigneeSpec;
    use serde_json::json;
    use std::time::Duration;

    type TestCoordinator = WorkflowCoordinator<MockRepository, MockDirectory, MockLock, RecordingSink>;

    struct Harness {
        coordinator: TestCoordinator,
        repo: Arc<MockRepository>,
        lock: Arc<MockLock>,
        events: Arc<RecordingSink>,
        ctx: TenantContext,
    }

    fn harness() -> Harness {
        let directory = MockDirectory::default()
            .with_role("lead", &["lena"])
            .with_role("manager", &["max"]);
        let lock = Arc::new(MockLock::default());
        let events = Arc::new(RecordingSink::default());
        let repo = Arc::new(MockRepository::default());
        let coordinator = WorkflowCoordinator::new(
            repo.clone(),
            Arc::new(directory),
            lock.clone(),
            events.clone(),
            EngineConfig::default(),
        );
        Harness {
            coordinator,
            repo,
            lock,
            events,
            ctx: TenantContext::for_tenant("acme").with_user("emma"),
        }
    }

    async fn started(h: &Harness, amount: i64) -> WorkflowInstance {
        let def = h
            .coordinator
            .create_definition(&h.ctx, "expense", Some("Expense claims"), expense_config())
            .await
            .unwrap();
        h.coordinator
            .activate_definition_version(&h.ctx, &def.id, def.version)
            .await
            .unwrap();
        h.coordinator
            .start_instance(&h.ctx, &def.id, "emma", Some(json!({"amount": amount})), vec![])
            .await
            .unwrap()
    }

    async fn act(h: &Harness, id: &Uuid, action: &str, operator: &str) -> Result<WorkflowInstance, WorkflowError> {
        h.coordinator
            .process_action(&h.ctx, id, action, ActionPayload::new(operator))
            .await
    }

    #[tokio::test]
    async fn test_end_to_end_small_amount_is_approved() {
        let h = harness();
        let instance = started(&h, 50).await;
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert_eq!(instance.current_step, None);

        let after_submit = act(&h, &instance.id, "SUBMIT", "emma").await.unwrap();
        assert_eq!(after_submit.current_step.as_deref(), Some("start"));

        let at_task = act(&h, &instance.id, "APPROVE", "emma").await.unwrap();
        assert_eq!(at_task.current_step.as_deref(), Some("task"));

        let done = act(&h, &instance.id, "APPROVE", "lena").await.unwrap();
        assert_eq!(done.status, InstanceStatus::Approved);
        assert_eq!(done.current_step, None);

        assert_eq!(
            h.events.names(),
            vec!["workflow.submitted", "node.advanced", "workflow.completed"]
        );

        let fetched = h
            .coordinator
            .get_workflow_instance(&h.ctx, &instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, InstanceStatus::Approved);
        assert_eq!(h.lock.release_count(), 4, "activation + three actions");
    }

    #[tokio::test]
    async fn test_large_amount_routes_to_manager_then_completes() {
        let h = harness();
        let instance = started(&h, 500).await;
        act(&h, &instance.id, "submit", "emma").await.unwrap();
        act(&h, &instance.id, "approve", "emma").await.unwrap();

        let at_manager = act(&h, &instance.id, "approve", "lena").await.unwrap();
        assert_eq!(at_manager.current_step.as_deref(), Some("manager"));

        let nodes = h
            .coordinator
            .list_node_instances(&h.ctx, &instance.id)
            .await
            .unwrap();
        assert_eq!(nodes.last().unwrap().assignees, vec!["max"]);

        // manager -> end only: last node, completes without a new row.
        let done = act(&h, &instance.id, "approve", "max").await.unwrap();
        assert_eq!(done.status, InstanceStatus::Approved);
        assert_eq!(done.current_step, None);
    }

    #[tokio::test]
    async fn test_reject_terminates_and_guards_further_actions() {
        let h = harness();
        let instance = started(&h, 50).await;
        act(&h, &instance.id, "SUBMIT", "emma").await.unwrap();

        let payload = ActionPayload::new("emma").with_comment("missing receipt");
        let rejected = h
            .coordinator
            .process_action(&h.ctx, &instance.id, "REJECT", payload)
            .await
            .unwrap();
        assert_eq!(rejected.status, InstanceStatus::Rejected);
        assert_eq!(rejected.current_step, None);

        let err = act(&h, &instance.id, "APPROVE", "emma").await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::InstanceTerminated {
                status: InstanceStatus::Rejected,
                ..
            }
        ));
        assert!(!h.lock.is_held(&instance_lock_key(&h.ctx, &instance.id)));

        let nodes = h
            .coordinator
            .list_node_instances(&h.ctx, &instance.id)
            .await
            .unwrap();
        assert_eq!(nodes[0].status, NodeStatus::Rejected);
        assert_eq!(nodes[0].comments.as_deref(), Some("missing receipt"));
        assert!(nodes[0].resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_submit_ordering_is_enforced() {
        let h = harness();
        let instance = started(&h, 50).await;

        let err = act(&h, &instance.id, "APPROVE", "emma").await.unwrap_err();
        assert_eq!(err.code(), "NOT_SUBMITTED");

        act(&h, &instance.id, "SUBMIT", "emma").await.unwrap();
        let err = act(&h, &instance.id, "SUBMIT", "emma").await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_SUBMITTED");
    }

    #[tokio::test]
    async fn test_invalid_action_releases_lock() {
        let h = harness();
        let instance = started(&h, 50).await;

        let err = act(&h, &instance.id, "ESCALATE", "emma").await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidAction(ref a) if a == "ESCALATE"));
        assert!(!h.lock.is_held(&instance_lock_key(&h.ctx, &instance.id)));
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let h = harness();
        let missing = Uuid::now_v7();
        let err = act(&h, &missing, "APPROVE", "emma").await.unwrap_err();
        assert!(matches!(err, WorkflowError::InstanceNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_instances_are_tenant_scoped() {
        let h = harness();
        let instance = started(&h, 50).await;
        let other = TenantContext::for_tenant("globex");

        let found = h
            .coordinator
            .get_workflow_instance(&other, &instance.id)
            .await
            .unwrap();
        assert!(found.is_none());

        let err = h
            .coordinator
            .process_action(&other, &instance.id, "SUBMIT", ActionPayload::new("mallory"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSTANCE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_held_lock_is_retryable() {
        let h = harness();
        let instance = started(&h, 50).await;
        let key = instance_lock_key(&h.ctx, &instance.id);
        let token = h.lock.lock(&key, std::time::Duration::from_secs(5)).await.unwrap();

        let err = act(&h, &instance.id, "SUBMIT", "emma").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, WorkflowError::LockAcquisition { key: ref k } if *k == key));

        h.lock.unlock(&token).await.unwrap();
        act(&h, &instance.id, "SUBMIT", "emma").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_approvals_do_not_both_apply() {
        let h = harness();
        let instance = started(&h, 50).await;
        act(&h, &instance.id, "SUBMIT", "emma").await.unwrap();

        let (a, b) = tokio::join!(
            act(&h, &instance.id, "APPROVE", "emma"),
            act(&h, &instance.id, "APPROVE", "emma"),
        );

        let outcomes = [&a, &b];
        let ok = outcomes.iter().filter(|r| r.is_ok()).count();
        let busy = outcomes
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_retryable()))
            .count();
        assert_eq!((ok, busy), (1, 1));

        let history = h.coordinator.list_history(&h.ctx, &instance.id).await.unwrap();
        let approvals = history
            .iter()
            .filter(|e| e.action == WorkflowAction::Approve)
            .count();
        assert_eq!(approvals, 1);

        let current = h
            .coordinator
            .get_workflow_instance(&h.ctx, &instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.current_step.as_deref(), Some("task"));
    }

    #[tokio::test]
    async fn test_return_requires_known_target_and_appends_visit() {
        let h = harness();
        let instance = started(&h, 50).await;
        act(&h, &instance.id, "SUBMIT", "emma").await.unwrap();
        act(&h, &instance.id, "APPROVE", "emma").await.unwrap();

        let err = act(&h, &instance.id, "RETURN", "lena").await.unwrap_err();
        assert!(matches!(err, WorkflowError::MissingPayloadField("targetNode")));

        let mut payload = ActionPayload::new("lena");
        payload.target_node = Some("nowhere".to_string());
        let err = h
            .coordinator
            .process_action(&h.ctx, &instance.id, "RETURN", payload)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NodeNotFound(_)));

        let nodes = h
            .coordinator
            .list_node_instances(&h.ctx, &instance.id)
            .await
            .unwrap();
        assert_eq!(nodes.last().unwrap().status, NodeStatus::Pending, "unknown target changes nothing");

        let mut payload = ActionPayload::new("lena").with_comment("needs receipt");
        payload.target_node = Some("start".to_string());
        let returned = h
            .coordinator
            .process_action(&h.ctx, &instance.id, "RETURN", payload)
            .await
            .unwrap();
        assert_eq!(returned.current_step.as_deref(), Some("start"));
        assert_eq!(returned.status, InstanceStatus::Pending);

        let nodes = h
            .coordinator
            .list_node_instances(&h.ctx, &instance.id)
            .await
            .unwrap();
        let statuses: Vec<_> = nodes.iter().map(|n| (n.node_id.as_str(), n.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("start", NodeStatus::Approved),
                ("task", NodeStatus::Returned),
                ("start", NodeStatus::Pending),
            ]
        );
        assert_eq!(h.events.names().last(), Some(&"node.returned"));
    }

    #[tokio::test]
    async fn test_transfer_reassigns_pending_node() {
        let h = harness();
        let instance = started(&h, 50).await;
        act(&h, &instance.id, "SUBMIT", "emma").await.unwrap();
        act(&h, &instance.id, "APPROVE", "emma").await.unwrap();

        let mut payload = ActionPayload::new("lena");
        payload.node_id = Some("task".to_string());
        payload.new_assignee_id = Some("tom".to_string());
        let after = h
            .coordinator
            .process_action(&h.ctx, &instance.id, "TRANSFER", payload)
            .await
            .unwrap();
        assert_eq!(after.current_step.as_deref(), Some("task"));

        let nodes = h
            .coordinator
            .list_node_instances(&h.ctx, &instance.id)
            .await
            .unwrap();
        assert_eq!(nodes.last().unwrap().assignees, vec!["tom"]);

        let history = h.coordinator.list_history(&h.ctx, &instance.id).await.unwrap();
        assert_eq!(
            history.last().unwrap().comment.as_deref(),
            Some("transferred to: tom")
        );
        assert_eq!(h.events.names().last(), Some(&"node.transferred"));

        let mut payload = ActionPayload::new("lena");
        payload.node_id = Some("start".to_string());
        payload.new_assignee_id = Some("tom".to_string());
        let err = h
            .coordinator
            .process_action(&h.ctx, &instance.id, "TRANSFER", payload)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NODE_NOT_PENDING");
    }

    #[tokio::test]
    async fn test_activation_under_definition_lock() {
        let h = harness();
        let def = h
            .coordinator
            .create_definition(&h.ctx, "expense", None, expense_config())
            .await
            .unwrap();
        let v2 = h
            .coordinator
            .create_definition_version(&h.ctx, &def.id, expense_config())
            .await
            .unwrap();

        h.coordinator
            .activate_definition_version(&h.ctx, &def.id, v2.version)
            .await
            .unwrap();
        let versions = h
            .coordinator
            .list_definition_versions(&h.ctx, &def.id)
            .await
            .unwrap();
        let active: Vec<_> = versions.iter().filter(|d| d.is_active).map(|d| d.version).collect();
        assert_eq!(active, vec![2]);
        assert!(!h.lock.is_held(&definition_lock_key(&h.ctx, &def.id)));
    }

    /// Stores and activates a definition without authoring validation, as a
    /// row written by an older release would be.
    async fn started_unchecked(h: &Harness, config: WorkflowConfig) -> WorkflowInstance {
        let def = WorkflowDefinition {
            id: Uuid::now_v7(),
            tenant_id: h.ctx.tenant_id.clone(),
            name: "legacy".to_string(),
            description: None,
            version: 1,
            config,
            is_active: false,
            created_at: Utc::now(),
        };
        h.repo.insert_definition(&h.ctx, &def).await.unwrap();
        h.repo
            .activate_definition_version(&h.ctx, &def.id, 1)
            .await
            .unwrap();
        h.coordinator
            .start_instance(&h.ctx, &def.id, "emma", Some(json!({"amount": 50})), vec![])
            .await
            .unwrap()
    }

    fn config_with_task_resolver(resolver: &str) -> WorkflowConfig {
        let mut config = expense_config();
        config.nodes[1].assignee_resolver = Some(AssigneeSpec::Expression(resolver.to_string()));
        config
    }

    #[tokio::test]
    async fn test_failed_approve_leaves_no_partial_state() {
        let h = harness();
        let instance = started_unchecked(&h, config_with_task_resolver("group:ops")).await;
        act(&h, &instance.id, "SUBMIT", "emma").await.unwrap();

        for _ in 0..2 {
            let err = act(&h, &instance.id, "APPROVE", "emma").await.unwrap_err();
            assert_eq!(err.code(), "UNRESOLVED_ASSIGNEE_TYPE");
        }

        let current = h
            .coordinator
            .get_workflow_instance(&h.ctx, &instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.current_step.as_deref(), Some("start"));
        assert_eq!(current.status, InstanceStatus::Pending);

        let nodes = h
            .coordinator
            .list_node_instances(&h.ctx, &instance.id)
            .await
            .unwrap();
        let statuses: Vec<_> = nodes.iter().map(|n| (n.node_id.as_str(), n.status)).collect();
        assert_eq!(statuses, vec![("start", NodeStatus::Pending)]);

        let history = h.coordinator.list_history(&h.ctx, &instance.id).await.unwrap();
        let actions: Vec<_> = history.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![WorkflowAction::Submit]);

        // The start node is still open, so it can be handed to someone else.
        let mut payload = ActionPayload::new("emma");
        payload.new_assignee_id = Some("tom".to_string());
        h.coordinator
            .process_action(&h.ctx, &instance.id, "TRANSFER", payload)
            .await
            .unwrap();
        assert_eq!(h.events.names(), vec!["workflow.submitted", "node.transferred"]);
    }

    #[tokio::test]
    async fn test_failed_return_leaves_current_node_open() {
        let h = harness();
        let mut config = config_with_task_resolver("role:lead");
        config.nodes[0].assignee_resolver = Some(AssigneeSpec::Expression("group:ops".to_string()));
        let instance = started_unchecked(&h, config).await;

        // Submitting resolves the start node, so it fails before any write too.
        let err = act(&h, &instance.id, "SUBMIT", "emma").await.unwrap_err();
        assert_eq!(err.code(), "UNRESOLVED_ASSIGNEE_TYPE");
        let nodes = h
            .coordinator
            .list_node_instances(&h.ctx, &instance.id)
            .await
            .unwrap();
        assert!(nodes.is_empty());

        let h = harness();
        let mut config = config_with_task_resolver("role:lead");
        config.nodes[2].assignee_resolver = Some(AssigneeSpec::Expression("group:ops".to_string()));
        let instance = started_unchecked(&h, config).await;
        act(&h, &instance.id, "SUBMIT", "emma").await.unwrap();
        act(&h, &instance.id, "APPROVE", "emma").await.unwrap();

        let mut payload = ActionPayload::new("lena");
        payload.target_node = Some("manager".to_string());
        let err = h
            .coordinator
            .process_action(&h.ctx, &instance.id, "RETURN", payload)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNRESOLVED_ASSIGNEE_TYPE");

        let nodes = h
            .coordinator
            .list_node_instances(&h.ctx, &instance.id)
            .await
            .unwrap();
        let last = nodes.last().unwrap();
        assert_eq!((last.node_id.as_str(), last.status), ("task", NodeStatus::Pending));
        let history = h.coordinator.list_history(&h.ctx, &instance.id).await.unwrap();
        assert!(history.iter().all(|e| e.action != WorkflowAction::Return));
    }

    /// A directory whose lookups never complete.
    struct StalledDirectory;

    impl UserDirectory for StalledDirectory {
        async fn find_users_by_role(
            &self,
            _ctx: &TenantContext,
            _role: &str,
        ) -> Result<Vec<String>, DirectoryError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancelled_action_releases_lock() {
        let lock = Arc::new(MockLock::default());
        let coordinator = WorkflowCoordinator::new(
            Arc::new(MockRepository::default()),
            Arc::new(StalledDirectory),
            lock.clone(),
            Arc::new(RecordingSink::default()),
            EngineConfig::default(),
        );
        let ctx = TenantContext::for_tenant("acme");
        let def = coordinator
            .create_definition(&ctx, "expense", None, expense_config())
            .await
            .unwrap();
        coordinator
            .activate_definition_version(&ctx, &def.id, def.version)
            .await
            .unwrap();
        let instance = coordinator
            .start_instance(&ctx, &def.id, "emma", Some(json!({"amount": 50})), vec![])
            .await
            .unwrap();
        coordinator
            .process_action(&ctx, &instance.id, "SUBMIT", ActionPayload::new("emma"))
            .await
            .unwrap();

        // Approving resolves `role:lead`, which stalls until the caller gives up.
        let key = instance_lock_key(&ctx, &instance.id);
        let approve =
            coordinator.process_action(&ctx, &instance.id, "APPROVE", ActionPayload::new("emma"));
        let timed_out = tokio::time::timeout(Duration::from_millis(20), approve).await;
        assert!(timed_out.is_err());

        for _ in 0..10 {
            if !lock.is_held(&key) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!lock.is_held(&key));

        let nodes = coordinator.list_node_instances(&ctx, &instance.id).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn test_operator_defaults_to_context_user() {
        let h = harness();
        let instance = started(&h, 50).await;
        h.coordinator
            .process_action(&h.ctx, &instance.id, "SUBMIT", ActionPayload::default())
            .await
            .unwrap();

        let history = h.coordinator.list_history(&h.ctx, &instance.id).await.unwrap();
        assert_eq!(history[0].operator_id, "emma");
    }
}
