//! Single-node engine wiring.
//!
//! Connects the SQLite repository, the in-process lock, a static role
//! directory and the broadcast event bus to a `WorkflowCoordinator`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use procflow_core::event::EventBus;
use procflow_core::workflow::WorkflowCoordinator;
use procflow_types::config::EngineConfig;

use crate::config::load_engine_config;
use crate::memory::{MemoryLockManager, StaticUserDirectory};
use crate::sqlite::pool::DatabasePool;
use crate::sqlite::workflow::SqliteWorkflowRepository;

/// Coordinator over the SQLite repository and in-process lock.
pub type SqliteEngine =
    WorkflowCoordinator<SqliteWorkflowRepository, StaticUserDirectory, MemoryLockManager, EventBus>;

/// Errors raised while opening an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineInitError {
    #[error("failed to create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// An opened engine and the handles callers wire around it.
pub struct EngineHandle {
    pub coordinator: SqliteEngine,
    pub events: Arc<EventBus>,
    pub directory: Arc<StaticUserDirectory>,
    pub config: EngineConfig,
    pub db_pool: DatabasePool,
}

impl EngineHandle {
    /// Open `{data_dir}/procflow.db`, creating it if needed, and load
    /// `{data_dir}/config.toml`.
    pub async fn open(data_dir: &Path) -> Result<Self, EngineInitError> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|source| EngineInitError::DataDir {
                path: data_dir.to_path_buf(),
                source,
            })?;

        let config = load_engine_config(data_dir).await;
        let db_pool = DatabasePool::open(&data_dir.join("procflow.db")).await?;

        tracing::info!(data_dir = %data_dir.display(), "workflow engine opened");
        Ok(Self::with_pool(db_pool, config))
    }

    /// Wire an engine around an existing pool.
    pub fn with_pool(db_pool: DatabasePool, config: EngineConfig) -> Self {
        let events = Arc::new(EventBus::new(config.event_channel_capacity));
        let directory = Arc::new(StaticUserDirectory::new());
        let coordinator = WorkflowCoordinator::new(
            Arc::new(SqliteWorkflowRepository::new(db_pool.clone())),
            directory.clone(),
            Arc::new(MemoryLockManager::new()),
            events.clone(),
            config.clone(),
        );

        Self {
            coordinator,
            events,
            directory,
            config,
            db_pool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procflow_core::workflow::WorkflowError;
    use procflow_core::workflow::definition::parse_config_yaml;
    use procflow_types::event::WorkflowEvent;
    use procflow_types::tenant::TenantContext;
    use procflow_types::workflow::{ActionPayload, InstanceStatus, NodeStatus, WorkflowAction};
    use serde_json::json;
    use tempfile::TempDir;

    const EXPENSE_YAML: &str = r#"
nodes:
  - id: start
    type: start
    name: Submit
    assignee_resolver: "creator:"
  - id: task
    type: task
    name: Lead review
    assignee_resolver: "role:lead"
  - id: manager
    type: approval
    name: Manager approval
    assignee_resolver:
      type: role
      value: manager
      condition: "$assignee != $creator"
  - id: end
    type: end
    name: Done
edges:
  - source: start
    target: task
  - source: task
    target: manager
    condition: "amount > 100"
  - source: task
    target: end
  - source: manager
    target: end
"#;

    async fn open_engine() -> (TempDir, EngineHandle) {
        let tmp = TempDir::new().unwrap();
        let handle = EngineHandle::open(tmp.path()).await.unwrap();
        (tmp, handle)
    }

    async fn active_expense(handle: &EngineHandle, ctx: &TenantContext) -> uuid::Uuid {
        let config = parse_config_yaml(EXPENSE_YAML).unwrap();
        let def = handle
            .coordinator
            .create_definition(ctx, "expense", Some("Expense claims"), config)
            .await
            .unwrap();
        handle
            .coordinator
            .activate_definition_version(ctx, &def.id, def.version)
            .await
            .unwrap();
        def.id
    }

    #[tokio::test]
    async fn test_open_creates_database_and_uses_defaults() {
        let (tmp, handle) = open_engine().await;
        assert!(tmp.path().join("procflow.db").exists());
        assert_eq!(handle.config.lock_ttl_ms, 5_000);
    }

    #[tokio::test]
    async fn test_small_expense_is_approved_by_lead() {
        let (_tmp, handle) = open_engine().await;
        let ctx = TenantContext::for_tenant("acme");
        handle.directory.set_role(&ctx, "lead", vec!["lena".to_string()]);
        handle.directory.set_role(&ctx, "manager", vec!["mia".to_string()]);
        let mut rx = handle.events.subscribe();

        let def_id = active_expense(&handle, &ctx).await;
        let engine = &handle.coordinator;
        let instance = engine
            .start_instance(&ctx, &def_id, "emma", Some(json!({"amount": 50})), vec![])
            .await
            .unwrap();
        assert_eq!(instance.current_step, None);

        let submitted = engine
            .process_action(&ctx, &instance.id, "SUBMIT", ActionPayload::new("emma"))
            .await
            .unwrap();
        assert_eq!(submitted.current_step.as_deref(), Some("start"));

        let moved = engine
            .process_action(&ctx, &instance.id, "APPROVE", ActionPayload::new("emma"))
            .await
            .unwrap();
        assert_eq!(moved.current_step.as_deref(), Some("task"));

        let done = engine
            .process_action(&ctx, &instance.id, "approve", ActionPayload::new("lena"))
            .await
            .unwrap();
        assert_eq!(done.status, InstanceStatus::Approved);
        assert_eq!(done.current_step, None);

        let nodes = engine.list_node_instances(&ctx, &instance.id).await.unwrap();
        let path: Vec<_> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(path, vec!["start", "task", "end"]);
        assert_eq!(nodes[1].assignees, vec!["lena"]);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Approved));

        let history = engine.list_history(&ctx, &instance.id).await.unwrap();
        assert_eq!(history.first().unwrap().action, WorkflowAction::Submit);
        assert!(history.iter().any(|h| h.action == WorkflowAction::Approve));

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names.first(), Some(&"workflow.submitted"));
        assert_eq!(names.last(), Some(&"workflow.completed"));
    }

    #[tokio::test]
    async fn test_large_expense_routes_to_manager_and_can_be_rejected() {
        let (_tmp, handle) = open_engine().await;
        let ctx = TenantContext::host();
        handle.directory.set_role(&ctx, "lead", vec!["lena".to_string()]);
        handle
            .directory
            .set_role(&ctx, "manager", vec!["emma".to_string(), "mia".to_string()]);

        let def_id = active_expense(&handle, &ctx).await;
        let engine = &handle.coordinator;
        let instance = engine
            .start_instance(&ctx, &def_id, "emma", Some(json!({"amount": 250})), vec![])
            .await
            .unwrap();

        for (action, who) in [("SUBMIT", "emma"), ("APPROVE", "emma"), ("APPROVE", "lena")] {
            engine
                .process_action(&ctx, &instance.id, action, ActionPayload::new(who))
                .await
                .unwrap();
        }

        let at_manager = engine.get_workflow_instance(&ctx, &instance.id).await.unwrap().unwrap();
        assert_eq!(at_manager.current_step.as_deref(), Some("manager"));
        let nodes = engine.list_node_instances(&ctx, &instance.id).await.unwrap();
        // The creator is filtered out of the manager candidates.
        assert_eq!(nodes.last().unwrap().assignees, vec!["mia"]);

        let rejected = engine
            .process_action(
                &ctx,
                &instance.id,
                "REJECT",
                ActionPayload::new("mia").with_comment("over budget"),
            )
            .await
            .unwrap();
        assert_eq!(rejected.status, InstanceStatus::Rejected);

        let err = engine
            .process_action(&ctx, &instance.id, "APPROVE", ActionPayload::new("mia"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InstanceTerminated { .. }));
    }

    #[tokio::test]
    async fn test_return_and_transfer_persist() {
        let (_tmp, handle) = open_engine().await;
        let ctx = TenantContext::host();
        handle.directory.set_role(&ctx, "lead", vec!["lena".to_string()]);

        let def_id = active_expense(&handle, &ctx).await;
        let engine = &handle.coordinator;
        let instance = engine
            .start_instance(&ctx, &def_id, "emma", Some(json!({"amount": 10})), vec![])
            .await
            .unwrap();
        engine
            .process_action(&ctx, &instance.id, "SUBMIT", ActionPayload::new("emma"))
            .await
            .unwrap();
        engine
            .process_action(&ctx, &instance.id, "APPROVE", ActionPayload::new("emma"))
            .await
            .unwrap();

        let mut transfer = ActionPayload::new("lena");
        transfer.new_assignee_id = Some("lars".to_string());
        engine
            .process_action(&ctx, &instance.id, "TRANSFER", transfer)
            .await
            .unwrap();
        let nodes = engine.list_node_instances(&ctx, &instance.id).await.unwrap();
        assert_eq!(nodes.last().unwrap().assignees, vec!["lars"]);

        let mut ret = ActionPayload::new("lars");
        ret.target_node = Some("start".to_string());
        let returned = engine
            .process_action(&ctx, &instance.id, "RETURN", ret)
            .await
            .unwrap();
        assert_eq!(returned.current_step.as_deref(), Some("start"));

        let nodes = engine.list_node_instances(&ctx, &instance.id).await.unwrap();
        let statuses: Vec<_> = nodes.iter().map(|n| (n.node_id.as_str(), n.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("start", NodeStatus::Approved),
                ("task", NodeStatus::Returned),
                ("start", NodeStatus::Pending),
            ]
        );
    }

    #[tokio::test]
    async fn test_event_bus_carries_instance_snapshots() {
        let (_tmp, handle) = open_engine().await;
        let ctx = TenantContext::host();
        let def_id = active_expense(&handle, &ctx).await;
        let mut rx = handle.events.subscribe();

        let instance = handle
            .coordinator
            .start_instance(&ctx, &def_id, "emma", None, vec![])
            .await
            .unwrap();
        handle
            .coordinator
            .process_action(&ctx, &instance.id, "SUBMIT", ActionPayload::new("emma"))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            WorkflowEvent::Submitted { instance: snapshot } => {
                assert_eq!(snapshot.id, instance.id);
                assert_eq!(snapshot.current_step.as_deref(), Some("start"));
            }
            other => panic!("unexpected event: {}", other.name()),
        }
    }

    async fn expense_with_versions(handle: &EngineHandle, ctx: &TenantContext) -> uuid::Uuid {
        let config = parse_config_yaml(EXPENSE_YAML).unwrap();
        let def = handle
            .coordinator
            .create_definition(ctx, "expense", None, config.clone())
            .await
            .unwrap();
        for _ in 0..2 {
            handle
                .coordinator
                .create_definition_version(ctx, &def.id, config.clone())
                .await
                .unwrap();
        }
        def.id
    }

    async fn active_versions(handle: &EngineHandle, ctx: &TenantContext, id: &uuid::Uuid) -> Vec<i32> {
        handle
            .coordinator
            .list_definition_versions(ctx, id)
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.is_active)
            .map(|d| d.version)
            .collect()
    }

    #[tokio::test]
    async fn test_concurrent_activations_leave_one_active_version() {
        let (_tmp, handle) = open_engine().await;
        let ctx = TenantContext::for_tenant("acme");
        let id = expense_with_versions(&handle, &ctx).await;

        let c = &handle.coordinator;
        let (a, b, d) = tokio::join!(
            c.activate_definition_version(&ctx, &id, 1),
            c.activate_definition_version(&ctx, &id, 2),
            c.activate_definition_version(&ctx, &id, 3),
        );

        let mut activated = Vec::new();
        for (version, result) in [(1, a), (2, b), (3, d)] {
            match result {
                Ok(()) => activated.push(version),
                Err(e) => assert_eq!(e.code(), "LOCK_ACQUISITION", "{e}"),
            }
        }
        assert!(!activated.is_empty());

        let active = active_versions(&handle, &ctx, &id).await;
        assert_eq!(active.len(), 1);
        assert!(activated.contains(&active[0]));
    }

    #[tokio::test]
    async fn test_unlocked_concurrent_activations_stay_atomic() {
        let (_tmp, handle) = open_engine().await;
        let ctx = TenantContext::host();
        let id = expense_with_versions(&handle, &ctx).await;

        let m = handle.coordinator.manager();
        let results = tokio::join!(
            m.activate_definition_version(&ctx, &id, 1),
            m.activate_definition_version(&ctx, &id, 2),
            m.activate_definition_version(&ctx, &id, 3),
            m.activate_definition_version(&ctx, &id, 2),
        );
        assert!(results.0.is_ok() || results.1.is_ok() || results.2.is_ok());

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workflow_definitions WHERE id = ? AND is_active = 1",
        )
        .bind(id.to_string())
        .fetch_one(&handle.db_pool.reader)
        .await
        .unwrap();
        assert_eq!(active, 1);
        assert_eq!(active_versions(&handle, &ctx, &id).await.len(), 1);
    }
}
