//! Workflow repository trait definition.
//!
//! Defines the storage interface for versioned definitions, instances,
//! node-instances and the action history. The infrastructure layer
//! (procflow-infra) implements this trait with SQLite and in-memory stores.
//!
//! Every method takes the caller's [`TenantContext`]; implementations only
//! ever return rows belonging to that tenant scope.

use procflow_types::error::RepositoryError;
use procflow_types::tenant::TenantContext;
use procflow_types::workflow::{
    WorkflowDefinition, WorkflowHistory, WorkflowInstance, WorkflowNodeInstance,
};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers four entity families:
/// - **Definitions:** versioned graphs, at most one active version per id.
/// - **Instances:** running executions pinned to a definition version.
/// - **Node-instances:** one append-only row per node visit.
/// - **History:** append-only audit log of actions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Insert a new definition version. Fails with `Conflict` if
    /// `(id, version)` already exists.
    fn insert_definition(
        &self,
        ctx: &TenantContext,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get one specific version of a definition.
    fn get_definition(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
        version: i32,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Get the active version of a definition, if any.
    fn get_active_definition(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Highest version number stored for a definition id.
    fn latest_definition_version(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<i32>, RepositoryError>> + Send;

    /// All versions of a definition, ordered by version ASC.
    fn list_definition_versions(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Atomically deactivate every version of `id` and activate `version`.
    ///
    /// Fails with `NotFound` (leaving activation untouched) if the version
    /// does not exist.
    fn activate_definition_version(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
        version: i32,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    fn create_instance(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_instance(
        &self,
        ctx: &TenantContext,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Persist `status`, `current_step` and `updated_at` of an instance.
    fn update_instance(
        &self,
        ctx: &TenantContext,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Node-instances
    // -----------------------------------------------------------------------

    fn create_node_instance(
        &self,
        ctx: &TenantContext,
        node: &WorkflowNodeInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist `status`, `assignees`, `comments` and `resolved_at` of a
    /// node-instance.
    fn update_node_instance(
        &self,
        ctx: &TenantContext,
        node: &WorkflowNodeInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Most recently created node-instance of an instance.
    fn latest_node_instance(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowNodeInstance>, RepositoryError>> + Send;

    /// Most recently created node-instance of an instance for one node.
    fn latest_node_instance_for(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
        node_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowNodeInstance>, RepositoryError>> + Send;

    /// All node-instances of an instance in creation order.
    fn list_node_instances(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowNodeInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    fn append_history(
        &self,
        ctx: &TenantContext,
        entry: &WorkflowHistory,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// History of an instance in creation order.
    fn list_history(
        &self,
        ctx: &TenantContext,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowHistory>, RepositoryError>> + Send;
}
