//! DashMap-backed lease lock.
//!
//! Each key maps to the holder's token value and an expiry instant. An
//! expired lease is treated as absent, so a crashed holder stops blocking
//! others once its TTL runs out.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use procflow_core::lock::{DistributedLock, LockToken};
use procflow_types::error::LockError;

struct Lease {
    value: String,
    expires_at: Instant,
}

/// In-process implementation of [`DistributedLock`].
#[derive(Default)]
pub struct MemoryLockManager {
    leases: DashMap<String, Lease>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an unexpired lease currently exists for `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .map(|lease| lease.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Drop expired leases. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.leases.len();
        self.leases.retain(|_, lease| lease.expires_at > now);
        before - self.leases.len()
    }
}

impl DistributedLock for MemoryLockManager {
    async fn lock(&self, key: &str, ttl: Duration) -> Result<LockToken, LockError> {
        let now = Instant::now();
        let token = LockToken::new(key);
        let lease = Lease {
            value: token.value.clone(),
            expires_at: now + ttl,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at > now {
                    return Err(LockError::Held {
                        key: key.to_string(),
                    });
                }
                tracing::debug!(key, "taking over expired lease");
                entry.insert(lease);
            }
            Entry::Vacant(entry) => {
                entry.insert(lease);
            }
        }

        Ok(token)
    }

    async fn unlock(&self, token: &LockToken) -> Result<(), LockError> {
        let removed = self
            .leases
            .remove_if(&token.key, |_, lease| lease.value == token.value);
        if removed.is_none() {
            tracing::debug!(key = %token.key, "unlock ignored, lease expired or taken over");
        }
        Ok(())
    }
}
