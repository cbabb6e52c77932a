//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `procflow-core` using sqlx with split
//! read/write pools. Definition graphs, form data and assignee lists are
//! stored as JSON text. Every query is filtered by tenant using
//! `COALESCE(tenant_id, '')`, so the host scope is the empty string.

use chrono::{DateTime, Utc};
use procflow_core::repository::workflow::WorkflowRepository;
use procflow_types::error::RepositoryError;
use procflow_types::tenant::TenantContext;
use procflow_types::workflow::{
    InstanceStatus, NodeStatus, WorkflowAction, WorkflowConfig, WorkflowDefinition,
    WorkflowHistory, WorkflowInstance, WorkflowNodeInstance,
};
use serde::de::DeserializeOwned;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    id: String,
    version: i32,
    tenant_id: Option<String>,
    name: String,
    description: Option<String>,
    config: String,
    is_active: bool,
    created_at: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            version: row.try_get("version")?,
            tenant_id: row.try_get("tenant_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            config: row.try_get("config")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        let config: WorkflowConfig = parse_json(&self.config, "definition config")?;
        Ok(WorkflowDefinition {
            id: parse_uuid(&self.id)?,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            version: self.version,
            config,
            is_active: self.is_active,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct InstanceRow {
    id: String,
    tenant_id: Option<String>,
    definition_id: String,
    version: i32,
    creator_id: String,
    form_data: String,
    attachments: String,
    status: String,
    current_step: Option<String>,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            definition_id: row.try_get("definition_id")?,
            version: row.try_get("version")?,
            creator_id: row.try_get("creator_id")?,
            form_data: row.try_get("form_data")?,
            attachments: row.try_get("attachments")?,
            status: row.try_get("status")?,
            current_step: row.try_get("current_step")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            tenant_id: self.tenant_id,
            definition_id: parse_uuid(&self.definition_id)?,
            version: self.version,
            creator_id: self.creator_id,
            form_data: parse_json(&self.form_data, "form_data")?,
            attachments: parse_json(&self.attachments, "attachments")?,
            status: parse_enum::<InstanceStatus>(&self.status, "instance status")?,
            current_step: self.current_step,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct NodeInstanceRow {
    id: String,
    instance_id: String,
    node_id: String,
    status: String,
    assignees: String,
    comments: Option<String>,
    resolved_at: Option<String>,
    created_at: String,
}

impl NodeInstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            node_id: row.try_get("node_id")?,
            status: row.try_get("status")?,
            assignees: row.try_get("assignees")?,
            comments: row.try_get("comments")?,
            resolved_at: row.try_get("resolved_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_node_instance(self) -> Result<WorkflowNodeInstance, RepositoryError> {
        Ok(WorkflowNodeInstance {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            node_id: self.node_id,
            status: parse_enum::<NodeStatus>(&self.status, "node status")?,
            assignees: parse_json(&self.assignees, "assignees")?,
            comments: self.comments,
            resolved_at: self.resolved_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct HistoryRow {
    id: String,
    instance_id: String,
    action: String,
    operator_id: String,
    comment: Option<String>,
    data: Option<String>,
    created_at: String,
}

impl HistoryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            action: row.try_get("action")?,
            operator_id: row.try_get("operator_id")?,
            comment: row.try_get("comment")?,
            data: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_history(self) -> Result<WorkflowHistory, RepositoryError> {
        Ok(WorkflowHistory {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            action: parse_enum::<WorkflowAction>(&self.action, "history action")?,
            operator_id: self.operator_id,
            comment: self.comment,
            data: self
                .data
                .as_deref()
                .map(|s| parse_json(s, "history data"))
                .transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn parse_enum<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

/// Host scope is stored as NULL and matched as ''.
fn tenant_key(ctx: &TenantContext) -> &str {
    ctx.tenant_id.as_deref().unwrap_or("")
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            tracing::warn!(error = %e, "workflow store unavailable");
            RepositoryError::Connection(e.to_string())
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

fn insert_error(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        _ => query_error(e),
    }
}

const DEFINITION_COLUMNS: &str =
    "id, version, tenant_id, name, description, config, is_active, created_at";
const NODE_COLUMNS: &str =
    "id, instance_id, node_id, status, assignees, comments, resolved_at, created_at";

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn insert_definition(
        &self,
        ctx: &TenantContext,
        def: &WorkflowDefinition,
    ) -> Result<(), RepositoryError> {
        let config_json = to_json(&def.config)?;

        sqlx::query(
            r#"INSERT INTO workflow_definitions
               (id, version, tenant_id, name, description, config, is_active, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(def.id.to_string())
        .bind(def.version)
        .bind(&ctx.tenant_id)
        .bind(&def.name)
        .bind(&def.description)
        .bind(&config_json)
        .bind(def.is_active)
        .bind(format_datetime(&def.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(insert_error)?;

        Ok(())
    }

    async fn get_definition(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let sql = format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions \
             WHERE id = ? AND version = ? AND COALESCE(tenant_id, '') = ?"
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(version)
            .bind(tenant_key(ctx))
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|r| DefinitionRow::from_row(&r).map_err(query_error)?.into_definition())
            .transpose()
    }

    async fn get_active_definition(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let sql = format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions \
             WHERE id = ? AND is_active = 1 AND COALESCE(tenant_id, '') = ?"
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(tenant_key(ctx))
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|r| DefinitionRow::from_row(&r).map_err(query_error)?.into_definition())
            .transpose()
    }

    async fn latest_definition_version(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Option<i32>, RepositoryError> {
        let row: (Option<i32>,) = sqlx::query_as(
            "SELECT MAX(version) FROM workflow_definitions WHERE id = ? AND COALESCE(tenant_id, '') = ?",
        )
        .bind(id.to_string())
        .bind(tenant_key(ctx))
        .fetch_one(&self.pool.reader)
        .await
        .map_err(query_error)?;

        Ok(row.0)
    }

    async fn list_definition_versions(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let sql = format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions \
             WHERE id = ? AND COALESCE(tenant_id, '') = ? ORDER BY version ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(tenant_key(ctx))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            defs.push(DefinitionRow::from_row(row).map_err(query_error)?.into_definition()?);
        }
        Ok(defs)
    }

    async fn activate_definition_version(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
        version: i32,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query(
            "UPDATE workflow_definitions SET is_active = 0 \
             WHERE id = ? AND is_active = 1 AND COALESCE(tenant_id, '') = ?",
        )
        .bind(id.to_string())
        .bind(tenant_key(ctx))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let result = sqlx::query(
            "UPDATE workflow_definitions SET is_active = 1 \
             WHERE id = ? AND version = ? AND COALESCE(tenant_id, '') = ?",
        )
        .bind(id.to_string())
        .bind(version)
        .bind(tenant_key(ctx))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(query_error)?;
            return Err(RepositoryError::NotFound);
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn create_instance(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, tenant_id, definition_id, version, creator_id, form_data, attachments,
                status, current_step, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.to_string())
        .bind(&ctx.tenant_id)
        .bind(instance.definition_id.to_string())
        .bind(instance.version)
        .bind(&instance.creator_id)
        .bind(to_json(&instance.form_data)?)
        .bind(to_json(&instance.attachments)?)
        .bind(instance.status.as_str())
        .bind(&instance.current_step)
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(insert_error)?;

        Ok(())
    }

    async fn get_instance(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM workflow_instances WHERE id = ? AND COALESCE(tenant_id, '') = ?",
        )
        .bind(id.to_string())
        .bind(tenant_key(ctx))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.map(|r| InstanceRow::from_row(&r).map_err(query_error)?.into_instance())
            .transpose()
    }

    async fn update_instance(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_instances SET status = ?, current_step = ?, updated_at = ? \
             WHERE id = ? AND COALESCE(tenant_id, '') = ?",
        )
        .bind(instance.status.as_str())
        .bind(&instance.current_step)
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.id.to_string())
        .bind(tenant_key(ctx))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn create_node_instance(
        &self,
        ctx: &TenantContext,
        node: &WorkflowNodeInstance,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_node_instances
               (id, tenant_id, instance_id, node_id, status, assignees, comments, resolved_at, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(node.id.to_string())
        .bind(&ctx.tenant_id)
        .bind(node.instance_id.to_string())
        .bind(&node.node_id)
        .bind(node.status.as_str())
        .bind(to_json(&node.assignees)?)
        .bind(&node.comments)
        .bind(node.resolved_at.as_ref().map(format_datetime))
        .bind(format_datetime(&node.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(insert_error)?;

        Ok(())
    }

    async fn update_node_instance(
        &self,
        ctx: &TenantContext,
        node: &WorkflowNodeInstance,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_node_instances SET status = ?, assignees = ?, comments = ?, resolved_at = ? \
             WHERE id = ? AND COALESCE(tenant_id, '') = ?",
        )
        .bind(node.status.as_str())
        .bind(to_json(&node.assignees)?)
        .bind(&node.comments)
        .bind(node.resolved_at.as_ref().map(format_datetime))
        .bind(node.id.to_string())
        .bind(tenant_key(ctx))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn latest_node_instance(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Option<WorkflowNodeInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM workflow_node_instances \
             WHERE instance_id = ? AND COALESCE(tenant_id, '') = ? \
             ORDER BY rowid DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(instance_id.to_string())
            .bind(tenant_key(ctx))
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|r| NodeInstanceRow::from_row(&r).map_err(query_error)?.into_node_instance())
            .transpose()
    }

    async fn latest_node_instance_for(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
        node_id: &str,
    ) -> Result<Option<WorkflowNodeInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM workflow_node_instances \
             WHERE instance_id = ? AND node_id = ? AND COALESCE(tenant_id, '') = ? \
             ORDER BY rowid DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(instance_id.to_string())
            .bind(node_id)
            .bind(tenant_key(ctx))
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|r| NodeInstanceRow::from_row(&r).map_err(query_error)?.into_node_instance())
            .transpose()
    }

    async fn list_node_instances(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Vec<WorkflowNodeInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM workflow_node_instances \
             WHERE instance_id = ? AND COALESCE(tenant_id, '') = ? ORDER BY rowid ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(instance_id.to_string())
            .bind(tenant_key(ctx))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in &rows {
            nodes.push(NodeInstanceRow::from_row(row).map_err(query_error)?.into_node_instance()?);
        }
        Ok(nodes)
    }

    async fn append_history(
        &self,
        ctx: &TenantContext,
        entry: &WorkflowHistory,
    ) -> Result<(), RepositoryError> {
        let data = entry.data.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_history
               (id, tenant_id, instance_id, action, operator_id, comment, data, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id.to_string())
        .bind(&ctx.tenant_id)
        .bind(entry.instance_id.to_string())
        .bind(entry.action.as_str())
        .bind(&entry.operator_id)
        .bind(&entry.comment)
        .bind(&data)
        .bind(format_datetime(&entry.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(insert_error)?;

        Ok(())
    }

    async fn list_history(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> Result<Vec<WorkflowHistory>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, instance_id, action, operator_id, comment, data, created_at \
             FROM workflow_history WHERE instance_id = ? AND COALESCE(tenant_id, '') = ? \
             ORDER BY rowid ASC",
        )
        .bind(instance_id.to_string())
        .bind(tenant_key(ctx))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(HistoryRow::from_row(row).map_err(query_error)?.into_history()?);
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
