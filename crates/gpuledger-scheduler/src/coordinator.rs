//! Allocation coordinator
//!
//! Picks a slot from a ledger snapshot and reserves it with the store's
//! atomic `reserve`. A snapshot can be stale by the time the reservation
//! lands; losing that race re-scans instead of failing, bounded by an
//! attempt count and a time budget.

use gpuledger_core::{
    AllocatorConfig, Binding, CapacityRecord, LedgerError, LedgerResult, WorkloadId,
};
use gpuledger_store::LedgerStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::placement::{FirstFit, PlacementStrategy};

/// Bounds on the re-scan loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Total time an allocation may spend re-scanning
    pub budget: Duration,
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, doubling from the initial value
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&AllocatorConfig::default())
    }
}

impl From<&AllocatorConfig> for RetryPolicy {
    fn from(config: &AllocatorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            budget: Duration::from_millis(config.budget_ms),
        }
    }
}

/// Coordinates VRAM allocations against a shared ledger store
pub struct AllocationCoordinator {
    store: Arc<dyn LedgerStore>,
    strategy: Arc<dyn PlacementStrategy>,
    policy: RetryPolicy,
}

impl AllocationCoordinator {
    /// Create a first-fit coordinator
    pub fn new(store: Arc<dyn LedgerStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            strategy: Arc::new(FirstFit),
            policy,
        }
    }

    /// Replace the placement strategy
    pub fn with_strategy(mut self, strategy: Arc<dyn PlacementStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Reserve `requested` VRAM units on the first slot that fits
    pub async fn allocate(&self, requested: i64) -> LedgerResult<Binding> {
        let (binding, _) = self.place(None, requested).await?;
        Ok(binding)
    }

    /// Reserve `requested` units and persist the binding for `workload`.
    ///
    /// The returned guard releases the reservation unless committed.
    pub async fn allocate_for(
        &self,
        workload: &WorkloadId,
        requested: i64,
    ) -> LedgerResult<Reservation> {
        let (binding, uid) = self.place(Some(workload), requested).await?;
        Ok(Reservation {
            store: Arc::clone(&self.store),
            workload: workload.clone(),
            binding,
            uid: uid.unwrap_or_default(),
            armed: true,
        })
    }

    /// Return a binding's amount to its slot
    pub async fn release(&self, binding: &Binding) -> LedgerResult<CapacityRecord> {
        self.store
            .release(&binding.node_id, binding.slot_id, binding.amount)
            .await
    }

    /// Returns the binding and, for workload reservations, the uid of the
    /// persisted binding
    async fn place(
        &self,
        workload: Option<&WorkloadId>,
        requested: i64,
    ) -> LedgerResult<(Binding, Option<String>)> {
        let amount = validate_request(requested)?;
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let snapshot = self.store.list_capacity().await?;
            let candidate = self
                .strategy
                .select(&snapshot, amount)
                .ok_or(LedgerError::NoCapacityAvailable { requested: amount })?;
            let binding = Binding::new(candidate.node_id.clone(), candidate.slot_id, amount);

            let reserved = match workload {
                Some(id) => self
                    .store
                    .reserve_for(id, &binding)
                    .await
                    .map(|record| Some(record.uid)),
                None => self
                    .store
                    .reserve(&binding.node_id, binding.slot_id, amount)
                    .await
                    .map(|_| None),
            };

            match reserved {
                Ok(uid) => {
                    info!(binding = %binding, attempt = attempt, "Allocated VRAM");
                    return Ok((binding, uid));
                }
                Err(LedgerError::InsufficientCapacity { .. }) | Err(LedgerError::NotFound(_)) => {
                    let backoff = self.policy.backoff(attempt);
                    if attempt >= self.policy.max_attempts
                        || started.elapsed() + backoff > self.policy.budget
                    {
                        warn!(
                            requested = amount,
                            attempts = attempt,
                            "Allocation retry budget exhausted"
                        );
                        return Err(LedgerError::NoCapacityAvailable { requested: amount });
                    }
                    debug!(
                        binding = %binding,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Lost reservation race, re-scanning"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn validate_request(requested: i64) -> LedgerResult<u64> {
    if requested <= 0 {
        return Err(LedgerError::InvalidRequest(format!(
            "requested VRAM must be positive, got {}",
            requested
        )));
    }
    Ok(requested as u64)
}

/// A reservation held on behalf of a workload.
///
/// Dropping an uncommitted reservation reclaims it in the background, so an
/// abandoned request never leaks capacity.
#[must_use = "an uncommitted reservation is released when dropped"]
pub struct Reservation {
    store: Arc<dyn LedgerStore>,
    workload: WorkloadId,
    binding: Binding,
    uid: String,
    armed: bool,
}

impl Reservation {
    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// Uid of the persisted binding
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn workload(&self) -> &WorkloadId {
        &self.workload
    }

    /// Keep the reservation; the lifecycle reconciler now owns it
    pub fn commit(mut self) -> Binding {
        self.armed = false;
        self.binding.clone()
    }

    /// Undo the reservation now
    pub async fn cancel(mut self) -> LedgerResult<()> {
        self.armed = false;
        match self.store.reclaim(&self.workload, Some(&self.uid)).await {
            Ok(Some(record)) => {
                info!(workload = %self.workload, binding = %record.binding, "Reservation released");
                Ok(())
            }
            Ok(None) => {
                warn!(workload = %self.workload, "Reservation already released");
                Ok(())
            }
            Err(e) => {
                error!(workload = %self.workload, error = %e, "Failed to release reservation");
                Err(e)
            }
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let store = Arc::clone(&self.store);
        let workload = self.workload.clone();
        let uid = std::mem::take(&mut self.uid);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(workload = %workload, "Reservation abandoned, releasing");
                handle.spawn(async move {
                    if let Err(e) = store.reclaim(&workload, Some(&uid)).await {
                        error!(workload = %workload, error = %e, "Failed to release abandoned reservation");
                    }
                });
            }
            Err(_) => {
                error!(workload = %workload, "Reservation abandoned outside a runtime, capacity leaked");
            }
        }
    }
}
