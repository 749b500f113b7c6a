//! Execution gate: admits at most one workflow at a time across every process
//! sharing the lease store.
//!
//! Callers take a [`Permit`] with [`ExecutionGate::acquire`] and hand it back
//! with [`ExecutionGate::release`], or let [`ExecutionGate::run_exclusive`] do
//! both around a future. Release is a compare-and-delete on the holder, so a
//! holder whose lease already expired cannot remove its successor's lease.

use crate::config::{Backend, BackoffConfig, GateConfig};
use crate::errors::{GateError, GateResult, StoreResult, WeaverResult};
use crate::lease::{Lease, LeaseStore, MemoryLeaseStore};
use crate::lease_manager::SqliteLeaseStore;
use chrono::Duration;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Upper bound on a configured lease TTL (one year).
const MAX_TTL_SECS: u64 = 365 * 24 * 3600;

/// Proof that the caller holds the lease.
#[must_use = "a permit must be handed back to ExecutionGate::release"]
#[derive(Debug)]
pub struct Permit {
    holder: String,
    /// Granted without a lease because the store was unavailable and the gate fails open
    bypassed: bool,
}

impl Permit {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }
}

/// Single-flight limiter over one global lease key.
pub struct ExecutionGate {
    store: Arc<dyn LeaseStore>,
    key: String,
    ttl: Duration,
    fail_open: bool,
}

impl ExecutionGate {
    pub fn new(store: Arc<dyn LeaseStore>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
            fail_open: false,
        }
    }

    /// Admit requests when the lease store itself fails.
    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Build the gate and its store from configuration.
    pub async fn from_config(config: &GateConfig) -> WeaverResult<Self> {
        let store: Arc<dyn LeaseStore> = match config.backend {
            Backend::Memory => Arc::new(MemoryLeaseStore::new()),
            Backend::Sqlite => Arc::new(SqliteLeaseStore::open(config.db_path.clone()).await?),
        };

        let ttl = Duration::seconds(config.ttl_secs.min(MAX_TTL_SECS) as i64);
        Ok(Self::new(store, config.key.clone(), ttl).with_fail_open(config.fail_open))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take the lease for `holder`, or reject immediately with `GateError::Busy`.
    pub async fn acquire(&self, holder: &str) -> GateResult<Permit> {
        match self.store.try_acquire(&self.key, holder, self.ttl).await {
            Ok(true) => {
                info!(key = %self.key, holder, "Execution lease acquired");
                Ok(Permit {
                    holder: holder.to_string(),
                    bypassed: false,
                })
            }
            Ok(false) => {
                let current = self.store.current(&self.key).await.ok().flatten();
                let retry_after_secs = current
                    .as_ref()
                    .map(Lease::retry_after_secs)
                    .filter(|secs| *secs > 0)
                    .unwrap_or(1);
                let current_holder = current.map(|lease| lease.holder);
                debug!(key = %self.key, holder = ?current_holder, "Execution lease busy");
                Err(GateError::Busy {
                    holder: current_holder,
                    retry_after_secs,
                })
            }
            Err(e) if self.fail_open => {
                warn!("Lease store unavailable, admitting {} without a lease: {}", holder, e);
                Ok(Permit {
                    holder: holder.to_string(),
                    bypassed: true,
                })
            }
            Err(e) => {
                error!("Lease store unavailable: {}", e);
                Err(GateError::Store(e))
            }
        }
    }

    /// Hand the lease back. Returns true if this permit's lease was deleted.
    pub async fn release(&self, permit: Permit) -> bool {
        if permit.bypassed {
            return false;
        }

        match self.store.release(&self.key, &permit.holder).await {
            Ok(true) => {
                info!(key = %self.key, holder = %permit.holder, "Execution lease released");
                true
            }
            Ok(false) => {
                warn!(
                    key = %self.key,
                    holder = %permit.holder,
                    "Lease had already expired or passed to another holder"
                );
                false
            }
            Err(e) => {
                error!("Failed to release lease for {}: {}", permit.holder, e);
                false
            }
        }
    }

    /// Run `fut` while holding the lease.
    ///
    /// The lease is released on every exit path, including a panic inside `fut`,
    /// which is then resumed.
    pub async fn run_exclusive<F, T>(&self, holder: &str, fut: F) -> GateResult<T>
    where
        F: Future<Output = T>,
    {
        let permit = self.acquire(holder).await?;
        let outcome = AssertUnwindSafe(fut).catch_unwind().await;
        self.release(permit).await;

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// The unexpired lease, if any.
    pub async fn current(&self) -> StoreResult<Option<Lease>> {
        self.store.current(&self.key).await
    }

    /// Delete the lease whoever holds it.
    pub async fn force_release(&self) -> StoreResult<bool> {
        let removed = self.store.force_release(&self.key).await?;
        if removed {
            warn!(key = %self.key, "Execution lease force-released");
        }
        Ok(removed)
    }
}

/// Caller-side exponential backoff for busy rejections.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_attempts: u32,
    initial_delay: std::time::Duration,
    max_delay: std::time::Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl Backoff {
    pub fn new(
        max_attempts: u32,
        initial_delay: std::time::Duration,
        max_delay: std::time::Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            config.max_attempts,
            std::time::Duration::from_millis(config.initial_delay_ms),
            std::time::Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Delay before retry number `attempt` (1-based), honoring the server's hint.
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> std::time::Duration {
        let exponential = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let hinted = retry_after_secs
            .map(std::time::Duration::from_secs)
            .unwrap_or_default();
        exponential.max(hinted).min(self.max_delay)
    }

    /// Call `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    pub async fn retry<F, Fut, T>(&self, mut op: F) -> GateResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GateResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let hint = match &e {
                        GateError::Busy {
                            retry_after_secs, ..
                        } => Some(*retry_after_secs),
                        _ => None,
                    };
                    let delay = self.delay_for(attempt, hint);
                    warn!(attempt, ?delay, "Gate busy, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
