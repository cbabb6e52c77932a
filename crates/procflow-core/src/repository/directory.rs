//! User directory port used by role-based assignee resolution.

use procflow_types::error::DirectoryError;
use procflow_types::tenant::TenantContext;

/// Looks up principals by role within a tenant.
pub trait UserDirectory: Send + Sync {
    /// User ids holding `role` in the caller's tenant. Order is preserved by
    /// the resolver.
    fn find_users_by_role(
        &self,
        ctx: &TenantContext,
        role: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, DirectoryError>> + Send;
}
