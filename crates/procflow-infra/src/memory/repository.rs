//! Workflow repository held in process memory.
//!
//! Rows are tagged with the tenant of the context that wrote them and are
//! only visible to contexts of the same tenant. Append order is preserved,
//! which gives "latest" and listing queries their creation order.

use std::sync::Arc;

use procflow_core::repository::workflow::WorkflowRepository;
use procflow_types::error::RepositoryError;
use procflow_types::tenant::TenantContext;
use procflow_types::workflow::{
    WorkflowDefinition, WorkflowHistory, WorkflowInstance, WorkflowNodeInstance,
};
use tokio::sync::RwLock;
use uuid::Uuid;

struct Scoped<T> {
    tenant_id: Option<String>,
    row: T,
}

impl<T> Scoped<T> {
    fn visible_to(&self, ctx: &TenantContext) -> bool {
        self.tenant_id == ctx.tenant_id
    }
}

#[derive(Default)]
struct Tables {
    definitions: Vec<Scoped<WorkflowDefinition>>,
    instances: Vec<Scoped<WorkflowInstance>>,
    nodes: Vec<Scoped<WorkflowNodeInstance>>,
    history: Vec<Scoped<WorkflowHistory>>,
}

/// In-memory implementation of `WorkflowRepository`.
///
/// Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct InMemoryWorkflowRepository {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances across all tenants.
    pub async fn instance_count(&self) -> usize {
        self.tables.read().await.instances.len()
    }
}

fn scoped<T>(ctx: &TenantContext, row: T) -> Scoped<T> {
    Scoped {
        tenant_id: ctx.tenant_id.clone(),
        row,
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn insert_definition(
        &self,
        ctx: &TenantContext,
        def: &WorkflowDefinition,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let duplicate = tables
            .definitions
            .iter()
            .any(|d| d.row.id == def.id && d.row.version == def.version);
        if duplicate {
            return Err(RepositoryError::Conflict(format!(
                "definition {} version {} already exists",
                def.id, def.version
            )));
        }
        tables.definitions.push(scoped(ctx, def.clone()));
        Ok(())
    }

    async fn get_definition(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .definitions
            .iter()
            .find(|d| d.visible_to(ctx) && &d.row.id == id && d.row.version == version)
            .map(|d| d.row.clone()))
    }

    async fn get_active_definition(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .definitions
            .iter()
            .find(|d| d.visible_to(ctx) && &d.row.id == id && d.row.is_active)
            .map(|d| d.row.clone()))
    }

    async fn latest_definition_version(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Option<i32>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .definitions
            .iter()
            .filter(|d| d.visible_to(ctx) && &d.row.id == id)
            .map(|d| d.row.version)
            .max())
    }

    async fn list_definition_versions(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut defs: Vec<WorkflowDefinition> = tables
            .definitions
            .iter()
            .filter(|d| d.visible_to(ctx) && &d.row.id == id)
            .map(|d| d.row.clone())
            .collect();
        defs.sort_by_key(|d| d.version);
        Ok(defs)
    }

    async fn activate_definition_version(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
        version: i32,
    ) -> Result<(), RepositoryError> {
        // Both steps happen under one write guard.
        let mut tables = self.tables.write().await;
        let exists = tables
            .definitions
            .iter()
            .any(|d| d.visible_to(ctx) && &d.row.id == id && d.row.version == version);
        if !exists {
            return Err(RepositoryError::NotFound);
        }
        for d in tables
            .definitions
            .iter_mut()
            .filter(|d| d.visible_to(ctx) && &d.row.id == id)
        {
            d.row.is_active = d.row.version == version;
        }
        Ok(())
    }

    async fn create_instance(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.instances.iter().any(|i| i.row.id == instance.id) {
            return Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        tables.instances.push(scoped(ctx, instance.clone()));
        Ok(())
    }

    async fn get_instance(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .instances
            .iter()
            .find(|i| i.visible_to(ctx) && &i.row.id == id)
            .map(|i| i.row.clone()))
    }

    async fn update_instance(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .instances
            .iter_mut()
            .find(|i| i.visible_to(ctx) && i.row.id == instance.id)
            .ok_or(RepositoryError::NotFound)?;
        stored.row.status = instance.status;
        stored.row.current_step = instance.current_step.clone();
        stored.row.updated_at = instance.updated_at;
        Ok(())
    }

    async fn create_node_instance(
        &self,
        ctx: &TenantContext,
        node: &WorkflowNodeInstance,
    ) -> Result<(), RepositoryError> {
        self.tables.write().await.nodes.push(scoped(ctx, node.clone()));
        Ok(())
    }

    async fn update_node_instance(
        &self,
        ctx: &TenantContext,
        node: &WorkflowNodeInstance,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .nodes
            .iter_mut()
            .find(|n| n.visible_to(ctx) && n.row.id == node.id)
            .ok_or(RepositoryError::NotFound)?;
        stored.row.status = node.status;
        stored.row.assignees = node.assignees.clone();
        stored.row.comments = node.comments.clone();
        stored.row.resolved_at = node.resolved_at;
        Ok(())
    }

    async fn latest_node_instance(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Option<WorkflowNodeInstance>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .nodes
            .iter()
            .rev()
            .find(|n| n.visible_to(ctx) && &n.row.instance_id == instance_id)
            .map(|n| n.row.clone()))
    }

    async fn latest_node_instance_for(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
        node_id: &str,
    ) -> Result<Option<WorkflowNodeInstance>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .nodes
            .iter()
            .rev()
            .find(|n| {
                n.visible_to(ctx) && &n.row.instance_id == instance_id && n.row.node_id == node_id
            })
            .map(|n| n.row.clone()))
    }

    async fn list_node_instances(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Vec<WorkflowNodeInstance>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .nodes
            .iter()
            .filter(|n| n.visible_to(ctx) && &n.row.instance_id == instance_id)
            .map(|n| n.row.clone())
            .collect())
    }

    async fn append_history(
        &self,
        ctx: &TenantContext,
        entry: &WorkflowHistory,
    ) -> Result<(), RepositoryError> {
        self.tables.write().await.history.push(scoped(ctx, entry.clone()));
        Ok(())
    }

    async fn list_history(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Vec<WorkflowHistory>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .history
            .iter()
            .filter(|h| h.visible_to(ctx) && &h.row.instance_id == instance_id)
            .map(|h| h.row.clone())
            .collect())
    }
}
