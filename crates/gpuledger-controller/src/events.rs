//! Event loops connecting the control plane feeds to the controllers

use gpuledger_core::{NodeEvent, WorkloadEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::reconciler::LifecycleReconciler;
use crate::registrar::NodeRegistrar;

/// Register nodes as they are added to the cluster
pub async fn run_node_events(
    registrar: Arc<NodeRegistrar>,
    mut events: broadcast::Receiver<NodeEvent>,
) {
    info!("Node event loop started");
    loop {
        match events.recv().await {
            Ok(NodeEvent::Added(node)) => {
                debug!(node = %node.name, "Node added");
                registrar.spawn_handle(node);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Node events lagged, rescanning");
                if let Err(e) = registrar.rescan().await {
                    warn!(error = %e, "Node rescan failed");
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
    info!("Node event loop stopped");
}

/// Periodically rescan cluster nodes.
///
/// Node-added events fire once per node, so this is what retries nodes whose
/// registration failed and picks up nodes labelled after they joined.
pub async fn run_node_rescan(registrar: Arc<NodeRegistrar>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match registrar.rescan().await {
            Ok(pending) if !pending.is_empty() => {
                info!(pending = pending.len(), "Node rescan started registrations")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Node rescan failed"),
        }
    }
}

/// Feed workload status changes through the reconciler, in order
pub async fn run_workload_events(
    reconciler: Arc<LifecycleReconciler>,
    mut events: broadcast::Receiver<WorkloadEvent>,
) {
    info!("Workload event loop started");
    loop {
        match events.recv().await {
            Ok(WorkloadEvent::StatusChanged(workload)) => {
                if let Err(e) = reconciler.observe(&workload).await {
                    warn!(workload = %workload.id, error = %e, "Reconciliation failed");
                }
            }
            Ok(WorkloadEvent::Deleted(id)) => reconciler.forget(&id).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Workload events lagged, resyncing");
                if let Err(e) = reconciler.resync().await {
                    warn!(error = %e, "Workload resync failed");
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
    info!("Workload event loop stopped");
}

/// Periodically resync all managed workloads
pub async fn run_resync(reconciler: Arc<LifecycleReconciler>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match reconciler.resync().await {
            Ok(reclaimed) if reclaimed > 0 => {
                info!(reclaimed = reclaimed, "Resync reclaimed missed workloads")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Workload resync failed"),
        }
    }
}
