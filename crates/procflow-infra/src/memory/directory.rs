//! Static role directory.

use dashmap::DashMap;
use procflow_core::repository::directory::UserDirectory;
use procflow_types::error::DirectoryError;
use procflow_types::tenant::TenantContext;

/// Role membership keyed by `(tenant scope, role)`.
///
/// Lookups for an unknown role return an empty list.
#[derive(Default)]
pub struct StaticUserDirectory {
    roles: DashMap<(String, String), Vec<String>>,
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the members of `role` in the caller's tenant.
    pub fn set_role(&self, ctx: &TenantContext, role: &str, users: Vec<String>) {
        self.roles
            .insert((ctx.scope().into_owned(), role.to_string()), users);
    }

    /// Builder form of [`set_role`](Self::set_role).
    pub fn with_role(self, ctx: &TenantContext, role: &str, users: &[&str]) -> Self {
        self.set_role(ctx, role, users.iter().map(|u| u.to_string()).collect());
        self
    }
}

impl UserDirectory for StaticUserDirectory {
    async fn find_users_by_role(
        &self,
        ctx: &TenantContext,
        role: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        let key = (ctx.scope().into_owned(), role.to_string());
        Ok(self
            .roles
            .get(&key)
            .map(|users| users.clone())
            .unwrap_or_default())
    }
}
