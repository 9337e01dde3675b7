//! Lifecycle reconciler
//!
//! Edge-triggered: every status observation is compared with the cached
//! phase of the workload, and only a change into a terminal phase reclaims
//! the workload's VRAM. Repeated observations of the same phase are no-ops.
//!
//! The phase cache is updated before any remote call and the lock is never
//! held across one. If the ledger is unavailable during reclaim, the claimed
//! edge is rolled back and the workload is parked for the next resync.
//!
//! Workload names can be reused, so an observation is matched to its ledger
//! binding by reservation uid before anything is deleted or released.

use gpuledger_cluster::ControlPlane;
use gpuledger_core::{
    Binding, LedgerError, LedgerResult, ReconcilerConfig, Workload, WorkloadId, WorkloadPhase,
};
use gpuledger_store::LedgerStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What one observation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Same phase as before
    Unchanged,
    /// Phase changed but does not reclaim
    Transitioned,
    /// Binding released
    Reclaimed(Binding),
    /// Terminal workload whose binding was already released
    AlreadyReclaimed,
    /// Observation of an earlier workload whose name has since been bound
    /// again; nothing is deleted or released
    Superseded,
}

/// Reclaims VRAM when workloads finish
pub struct LifecycleReconciler {
    store: Arc<dyn LedgerStore>,
    plane: Arc<dyn ControlPlane>,
    selector: String,
    reclaim_on_failure: bool,
    phases: Mutex<HashMap<WorkloadId, WorkloadPhase>>,
    /// Terminal workloads whose reclaim hit an unavailable store
    deferred: Mutex<HashMap<WorkloadId, Workload>>,
}

impl LifecycleReconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        plane: Arc<dyn ControlPlane>,
        selector: impl Into<String>,
        config: &ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            plane,
            selector: selector.into(),
            reclaim_on_failure: config.reclaim_on_failure,
            phases: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
        }
    }

    /// Cached phase of a workload
    pub async fn cached_phase(&self, id: &WorkloadId) -> Option<WorkloadPhase> {
        self.phases.lock().await.get(id).copied()
    }

    /// Number of workloads waiting for the ledger to come back
    pub async fn deferred_count(&self) -> usize {
        self.deferred.lock().await.len()
    }

    /// Process one status observation
    pub async fn observe(&self, workload: &Workload) -> LedgerResult<ReconcileOutcome> {
        let phase = workload.phase;
        let previous = self.phases.lock().await.insert(workload.id.clone(), phase);

        if previous == Some(phase) {
            return Ok(ReconcileOutcome::Unchanged);
        }
        debug!(
            workload = %workload.id,
            from = ?previous,
            to = %phase,
            "Workload phase changed"
        );
        if !self.reclaims(phase) {
            return Ok(ReconcileOutcome::Transitioned);
        }

        match self.is_superseded(workload).await {
            Ok(false) => {}
            Ok(true) => {
                self.rollback(&workload.id, phase, previous).await;
                self.deferred.lock().await.remove(&workload.id);
                debug!(workload = %workload.id, "Observation predates the current binding, skipping");
                return Ok(ReconcileOutcome::Superseded);
            }
            Err(e) => return Err(self.fail(workload, previous, e).await),
        }

        info!(workload = %workload.id, phase = %phase, "Workload finished, reclaiming");
        self.delete(&workload.id).await;

        match self
            .store
            .reclaim(&workload.id, workload.binding_uid.as_deref())
            .await
        {
            Ok(Some(record)) => {
                if let Some(declared) = &workload.binding {
                    if declared != &record.binding {
                        warn!(
                            workload = %workload.id,
                            declared = %declared,
                            persisted = %record.binding,
                            "Declared binding differs from ledger, released ledger binding"
                        );
                    }
                }
                self.deferred.lock().await.remove(&workload.id);
                info!(workload = %workload.id, binding = %record.binding, "VRAM reclaimed");
                Ok(ReconcileOutcome::Reclaimed(record.binding))
            }
            Ok(None) if workload.binding.is_some() => {
                self.deferred.lock().await.remove(&workload.id);
                debug!(workload = %workload.id, "Binding already reclaimed");
                Ok(ReconcileOutcome::AlreadyReclaimed)
            }
            Ok(None) => {
                self.deferred.lock().await.remove(&workload.id);
                error!(workload = %workload.id, "No binding recorded for finished workload");
                Err(LedgerError::UnreconciledWorkload(workload.id.to_string()))
            }
            Err(e) => Err(self.fail(workload, previous, e).await),
        }
    }

    /// Whether the ledger binding for this name comes from a later
    /// reservation than the one recorded on the workload
    async fn is_superseded(&self, workload: &Workload) -> LedgerResult<bool> {
        let Some(uid) = workload.binding_uid.as_deref() else {
            return Ok(false);
        };
        Ok(self
            .store
            .binding(&workload.id)
            .await?
            .is_some_and(|record| !record.matches_uid(Some(uid))))
    }

    /// Handle a ledger error on a claimed terminal edge. An unavailable
    /// store rolls the edge back and parks the workload for resync.
    async fn fail(
        &self,
        workload: &Workload,
        previous: Option<WorkloadPhase>,
        e: LedgerError,
    ) -> LedgerError {
        if matches!(e, LedgerError::StoreUnavailable(_)) {
            self.rollback(&workload.id, workload.phase, previous).await;
            self.deferred
                .lock()
                .await
                .insert(workload.id.clone(), workload.clone());
            warn!(workload = %workload.id, error = %e, "Reclaim deferred");
        } else {
            error!(workload = %workload.id, error = %e, "Reclaim failed");
        }
        e
    }

    /// Drop a deleted workload from the phase cache
    pub async fn forget(&self, id: &WorkloadId) {
        if self.phases.lock().await.remove(id).is_some() {
            debug!(workload = %id, "Forgot workload");
        }
    }

    /// Retry deferred reclaims, then feed every managed workload through
    /// `observe`. Returns the number of bindings reclaimed.
    pub async fn resync(&self) -> LedgerResult<usize> {
        let deferred: Vec<Workload> = self.deferred.lock().await.values().cloned().collect();
        let listed = self.plane.list_workloads(&self.selector).await?;

        let mut reclaimed = 0;
        for workload in deferred.iter().chain(listed.iter()) {
            match self.observe(workload).await {
                Ok(ReconcileOutcome::Reclaimed(_)) => reclaimed += 1,
                Ok(_) => {}
                Err(e) => debug!(workload = %workload.id, error = %e, "Resync observation failed"),
            }
        }

        debug!(
            listed = listed.len(),
            deferred = deferred.len(),
            reclaimed = reclaimed,
            "Workload resync complete"
        );
        Ok(reclaimed)
    }

    fn reclaims(&self, phase: WorkloadPhase) -> bool {
        match phase {
            WorkloadPhase::Succeeded => true,
            WorkloadPhase::Failed => self.reclaim_on_failure,
            WorkloadPhase::Pending | WorkloadPhase::Running => false,
        }
    }

    async fn delete(&self, id: &WorkloadId) {
        match self.plane.delete_workload(id).await {
            Ok(()) => debug!(workload = %id, "Workload deleted"),
            Err(LedgerError::NotFound(_)) => debug!(workload = %id, "Workload already gone"),
            Err(e) => warn!(workload = %id, error = %e, "Failed to delete workload"),
        }
    }

    async fn rollback(
        &self,
        id: &WorkloadId,
        claimed: WorkloadPhase,
        previous: Option<WorkloadPhase>,
    ) {
        let mut phases = self.phases.lock().await;
        if phases.get(id) != Some(&claimed) {
            return;
        }
        match previous {
            Some(phase) => phases.insert(id.clone(), phase),
            None => phases.remove(id),
        };
    }
}
