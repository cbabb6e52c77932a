//! Explicit per-call tenant context.
//!
//! Every collaborator call receives a `TenantContext` instead of reading an
//! ambient thread-local. The scope string is used for lock keys and cache
//! keys.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Scope used when no tenant is attached to a request.
///
/// Scopes starting with a single `@` are reserved; tenant ids that start
/// with `@` are escaped with a second `@`.
pub const HOST_SCOPE: &str = "@host";

/// Who is calling, and on behalf of which tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    /// Tenant the request belongs to. `None` means the host (platform) scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Authenticated user issuing the request, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl TenantContext {
    /// Context for the host scope (no tenant).
    pub fn host() -> Self {
        Self::default()
    }

    /// Context bound to a tenant.
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            user_id: None,
        }
    }

    /// Attach the calling user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// The tenant id, or [`HOST_SCOPE`] when no tenant is attached. Distinct
    /// contexts always yield distinct scopes.
    pub fn scope(&self) -> Cow<'_, str> {
        match self.tenant_id.as_deref() {
            None => Cow::Borrowed(HOST_SCOPE),
            Some(tenant) if tenant.starts_with('@') => Cow::Owned(format!("@{tenant}")),
            Some(tenant) => Cow::Borrowed(tenant),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_scope_when_no_tenant() {
        assert_eq!(TenantContext::host().scope(), HOST_SCOPE);
    }

    #[test]
    fn test_tenant_scope() {
        let ctx = TenantContext::for_tenant("acme").with_user("u1");
        assert_eq!(ctx.scope(), "acme");
        assert_eq!(ctx.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_tenant_named_like_host_gets_its_own_scope() {
        let host = TenantContext::host();
        for name in ["host", "@host", "@@host"] {
            assert_ne!(TenantContext::for_tenant(name).scope(), host.scope(), "{name}");
        }
        assert_eq!(TenantContext::for_tenant("host").scope(), "host");
        assert_eq!(TenantContext::for_tenant("@host").scope(), "@@host");
        assert_ne!(
            TenantContext::for_tenant("@host").scope(),
            TenantContext::for_tenant("@@host").scope()
        );
    }
}
