//! Distributed lock port.
//!
//! The coordinator serializes actions on one instance by taking a short
//! lease on a key derived from the tenant scope and the instance id. The
//! backend (Redis in a cluster, in-process map for a single node) lives in
//! procflow-infra.

use std::time::Duration;

use procflow_types::error::LockError;
use procflow_types::tenant::TenantContext;
use uuid::Uuid;

/// Proof of a held lease. Only the holder of the token can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    /// Random value identifying this holder.
    pub value: String,
}

impl LockToken {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Uuid::new_v4().to_string(),
        }
    }
}

/// Set-if-absent lease with expiry.
pub trait DistributedLock: Send + Sync + 'static {
    /// Take the lease on `key` for `ttl`. Fails fast with
    /// [`LockError::Held`] if another unexpired holder owns it.
    fn lock(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<LockToken, LockError>> + Send;

    /// Release a lease. Releasing an expired or foreign lease is a no-op.
    fn unlock(
        &self,
        token: &LockToken,
    ) -> impl std::future::Future<Output = Result<(), LockError>> + Send;
}

/// Lock key guarding one instance: `wf_lock:{scope}:{instance_id}`.
pub fn instance_lock_key(ctx: &TenantContext, instance_id: &Uuid) -> String {
    format!("wf_lock:{}:{}", ctx.scope(), instance_id)
}

/// Lock key guarding activation of a definition: `wf_def_lock:{scope}:{definition_id}`.
pub fn definition_lock_key(ctx: &TenantContext, definition_id: &Uuid) -> String {
    format!("wf_def_lock:{}:{}", ctx.scope(), definition_id)
}
