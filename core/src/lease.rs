/// TTL-based exclusive lease over a single key.
///
/// This module provides:
/// - The `Lease` record stored under the key
/// - The `LeaseStore` trait: atomic set-if-absent with TTL and holder-checked release
/// - `MemoryLeaseStore` for single-process deployments and tests
///
/// The SQLite store lives in `lease_manager`.
use crate::errors::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// A lease granting its holder exclusive use of `key` until `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    /// Key the lease is held on
    pub key: String,

    /// Request id of the holder
    pub holder: String,

    pub acquired_at: DateTime<Utc>,

    /// acquired_at + ttl
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Create a lease starting now
    pub fn new(key: impl Into<String>, holder: impl Into<String>, ttl: Duration) -> Self {
        let acquired_at = Utc::now();
        Lease {
            key: key.into(),
            holder: holder.into(),
            acquired_at,
            expires_at: acquired_at + ttl,
        }
    }

    /// Check if this lease has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Get the remaining time until this lease expires
    pub fn time_remaining(&self) -> Option<Duration> {
        let remaining = self.expires_at - Utc::now();
        (remaining > Duration::zero()).then_some(remaining)
    }

    /// Whole seconds until expiry, rounded up; 0 once expired
    pub fn retry_after_secs(&self) -> u64 {
        self.time_remaining()
            .map(|d| ((d.num_milliseconds() + 999) / 1000).max(1) as u64)
            .unwrap_or(0)
    }
}

/// Storage backend for leases.
///
/// Implementations must make `try_acquire` and `release` atomic with respect
/// to each other: at most one unexpired lease exists per key at any instant.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take the lease on `key` for `holder` if it is free or expired.
    ///
    /// Returns false when another unexpired lease exists.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete the lease only if `holder` still owns it.
    ///
    /// Returns false when the lease is gone or belongs to someone else.
    async fn release(&self, key: &str, holder: &str) -> StoreResult<bool>;

    /// The current unexpired lease on `key`, if any.
    async fn current(&self, key: &str) -> StoreResult<Option<Lease>>;

    /// Delete the lease on `key` regardless of holder. For operators only.
    async fn force_release(&self, key: &str) -> StoreResult<bool>;
}

/// In-process lease store.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        let mut leases = self.leases.lock();
        if let Some(existing) = leases.get(key) {
            if !existing.is_expired() {
                return Ok(false);
            }
            debug!(key, previous = %existing.holder, "Taking over expired lease");
        }
        leases.insert(key.to_string(), Lease::new(key, holder, ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, holder: &str) -> StoreResult<bool> {
        let mut leases = self.leases.lock();
        match leases.get(key) {
            Some(lease) if lease.holder == holder => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current(&self, key: &str) -> StoreResult<Option<Lease>> {
        let leases = self.leases.lock();
        Ok(leases.get(key).filter(|l| !l.is_expired()).cloned())
    }

    async fn force_release(&self, key: &str) -> StoreResult<bool> {
        Ok(self.leases.lock().remove(key).is_some())
    }
}
