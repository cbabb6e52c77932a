//! In-memory collaborators shared by the workflow unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use procflow_types::error::{DirectoryError, LockError, RepositoryError};
use procflow_types::event::WorkflowEvent;
use procflow_types::tenant::TenantContext;
use procflow_types::workflow::{
    InstanceStatus, WorkflowConfig, WorkflowDefinition, WorkflowHistory, WorkflowInstance, WorkflowNodeInstance,
};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::event::EventSink;
use crate::lock::{DistributedLock, LockToken};
use crate::repository::directory::UserDirectory;
use crate::repository::workflow::WorkflowRepository;

/// start -> task -> {manager if amount > 100, end}; manager -> end.
pub fn expense_config() -> WorkflowConfig {
    serde_json::from_value(json!({
        "nodes": [
            {"id": "start", "type": "start", "name": "Submit", "assigneeResolver": "creator:"},
            {"id": "task", "type": "task", "name": "Lead review", "assigneeResolver": "role:lead"},
            {"id": "manager", "type": "approval", "name": "Manager approval", "assigneeResolver": "role:manager"},
            {"id": "end", "type": "end", "name": "Done"}
        ],
        "edges": [
            {"source": "start", "target": "task"},
            {"source": "task", "target": "manager", "condition": "amount > 100"},
            {"source": "task", "target": "end"},
            {"source": "manager", "target": "end"}
        ]
    }))
    .unwrap()
}

pub fn sample_instance(creator: &str, form_data: Value) -> WorkflowInstance {
    let now = Utc::now();
    WorkflowInstance {
        id: Uuid::now_v7(),
        tenant_id: None,
        definition_id: Uuid::now_v7(),
        version: 1,
        creator_id: creator.to_string(),
        form_data,
        attachments: vec![],
        status: InstanceStatus::Pending,
        current_step: None,
        created_at: now,
        updated_at: now,
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    definitions: Vec<WorkflowDefinition>,
    instances: Vec<WorkflowInstance>,
    nodes: Vec<WorkflowNodeInstance>,
    history: Vec<WorkflowHistory>,
}

/// Vec-backed repository. Rows are filtered by the caller's tenant.
#[derive(Default)]
pub struct MockRepository {
    tables: Mutex<Tables>,
}

fn same_tenant(ctx: &TenantContext, tenant_id: &Option<String>) -> bool {
    &ctx.tenant_id == tenant_id
}

impl MockRepository {
    fn with<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut guard = self.tables.lock().unwrap();
        f(&mut guard)
    }
}

impl WorkflowRepository for MockRepository {
    async fn insert_definition(
        &self,
        _ctx: &TenantContext,
        def: &WorkflowDefinition,
    ) -> Result<(), RepositoryError> {
        self.with(|t| {
            if t
                .definitions
                .iter()
                .any(|d| d.id == def.id && d.version == def.version)
            {
                return Err(RepositoryError::Conflict("duplicate version".to_string()));
            }
            t.definitions.push(def.clone());
            Ok(())
        })
    }

    async fn get_definition(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.with(|t| {
            t.definitions
                .iter()
                .find(|d| &d.id == id && d.version == version && same_tenant(ctx, &d.tenant_id))
                .cloned()
        }))
    }

    async fn get_active_definition(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.with(|t| {
            t.definitions
                .iter()
                .find(|d| &d.id == id && d.is_active && same_tenant(ctx, &d.tenant_id))
                .cloned()
        }))
    }

    async fn latest_definition_version(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Option<i32>, RepositoryError> {
        Ok(self.with(|t| {
            t.definitions
                .iter()
                .filter(|d| &d.id == id && same_tenant(ctx, &d.tenant_id))
                .map(|d| d.version)
                .max()
        }))
    }

    async fn list_definition_versions(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        Ok(self.with(|t| {
            let mut defs: Vec<_> = t
                .definitions
                .iter()
                .filter(|d| &d.id == id && same_tenant(ctx, &d.tenant_id))
                .cloned()
                .collect();
            defs.sort_by_key(|d| d.version);
            defs
        }))
    }

    async fn activate_definition_version(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
        version: i32,
    ) -> Result<(), RepositoryError> {
        self.with(|t| {
            let exists = t.definitions.iter().any(|d| {
                &d.id == id && d.version == version && same_tenant(ctx, &d.tenant_id)
            });
            if !exists {
                return Err(RepositoryError::NotFound);
            }
            for d in t
                .definitions
                .iter_mut()
                .filter(|d| &d.id == id && same_tenant(ctx, &d.tenant_id))
            {
                d.is_active = d.version == version;
            }
            Ok(())
        })
    }

    async fn create_instance(
        &self,
        _ctx: &TenantContext,
        instance: &WorkflowInstance,
    ) -> Result<(), RepositoryError> {
        self.with(|t| t.instances.push(instance.clone()));
        Ok(())
    }

    async fn get_instance(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        // Let concurrent callers interleave at the first read.
        tokio::task::yield_now().await;
        Ok(self.with(|t| {
            t.instances
                .iter()
                .find(|i| &i.id == id && same_tenant(ctx, &i.tenant_id))
                .cloned()
        }))
    }

    async fn update_instance(
        &self,
        _ctx: &TenantContext,
        instance: &WorkflowInstance,
    ) -> Result<(), RepositoryError> {
        self.with(|t| match t.instances.iter_mut().find(|i| i.id == instance.id) {
            Some(row) => {
                row.status = instance.status;
                row.current_step = instance.current_step.clone();
                row.updated_at = instance.updated_at;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        })
    }

    async fn create_node_instance(
        &self,
        _ctx: &TenantContext,
        node: &WorkflowNodeInstance,
    ) -> Result<(), RepositoryError> {
        self.with(|t| t.nodes.push(node.clone()));
        Ok(())
    }

    async fn update_node_instance(
        &self,
        _ctx: &TenantContext,
        node: &WorkflowNodeInstance,
    ) -> Result<(), RepositoryError> {
        self.with(|t| match t.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(row) => {
                *row = node.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        })
    }

    async fn latest_node_instance(
        &self,
        _ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Option<WorkflowNodeInstance>, RepositoryError> {
        Ok(self.with(|t| {
            t.nodes
                .iter()
                .rev()
                .find(|n| &n.instance_id == instance_id)
                .cloned()
        }))
    }

    async fn latest_node_instance_for(
        &self,
        _ctx: &TenantContext,
        instance_id: &Uuid,
        node_id: &str,
    ) -> Result<Option<WorkflowNodeInstance>, RepositoryError> {
        Ok(self.with(|t| {
            t.nodes
                .iter()
                .rev()
                .find(|n| &n.instance_id == instance_id && n.node_id == node_id)
                .cloned()
        }))
    }

    async fn list_node_instances(
        &self,
        _ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Vec<WorkflowNodeInstance>, RepositoryError> {
        Ok(self.with(|t| {
            t.nodes
                .iter()
                .filter(|n| &n.instance_id == instance_id)
                .cloned()
                .collect()
        }))
    }

    async fn append_history(
        &self,
        _ctx: &TenantContext,
        entry: &WorkflowHistory,
    ) -> Result<(), RepositoryError> {
        self.with(|t| t.history.push(entry.clone()));
        Ok(())
    }

    async fn list_history(
        &self,
        _ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Vec<WorkflowHistory>, RepositoryError> {
        Ok(self.with(|t| {
            t.history
                .iter()
                .filter(|h| &h.instance_id == instance_id)
                .cloned()
                .collect()
        }))
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockDirectory {
    roles: HashMap<String, Vec<String>>,
}

impl MockDirectory {
    pub fn with_role(mut self, role: &str, users: &[&str]) -> Self {
        self.roles.insert(
            role.to_string(),
            users.iter().map(|u| u.to_string()).collect(),
        );
        self
    }
}

impl UserDirectory for MockDirectory {
    async fn find_users_by_role(
        &self,
        _ctx: &TenantContext,
        role: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        Ok(self.roles.get(role).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// Non-expiring set-if-absent lock that counts releases.
#[derive(Default)]
pub struct MockLock {
    held: Mutex<HashMap<String, String>>,
    releases: AtomicUsize,
}

impl MockLock {
    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().unwrap().contains_key(key)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl DistributedLock for MockLock {
    async fn lock(&self, key: &str, _ttl: Duration) -> Result<LockToken, LockError> {
        let mut held = self.held.lock().unwrap();
        if held.contains_key(key) {
            return Err(LockError::Held {
                key: key.to_string(),
            });
        }
        let token = LockToken::new(key);
        held.insert(key.to_string(), token.value.clone());
        Ok(token)
    }

    async fn unlock(&self, token: &LockToken) -> Result<(), LockError> {
        let mut held = self.held.lock().unwrap();
        if held.get(&token.key) == Some(&token.value) {
            held.remove(&token.key);
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingSink {
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: WorkflowEvent) {
        self.events.lock().unwrap().push(event);
    }
}
