//! Control plane trait definitions

use async_trait::async_trait;
use gpuledger_core::{
    LedgerResult, NodeEvent, NodeInfo, Secret, Workload, WorkloadEvent, WorkloadId, WorkloadSpec,
};
use tokio::sync::broadcast;

/// Cluster control plane hosting workloads and emitting lifecycle events
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// List all cluster nodes
    async fn list_nodes(&self) -> LedgerResult<Vec<NodeInfo>>;

    /// List workloads matching a `key=value[,key=value]` label selector
    async fn list_workloads(&self, selector: &str) -> LedgerResult<Vec<Workload>>;

    /// Submit a new workload; `AlreadyExists` if the name is taken
    async fn create_workload(&self, spec: &WorkloadSpec) -> LedgerResult<Workload>;

    /// Delete a workload; `NotFound` if it does not exist
    async fn delete_workload(&self, id: &WorkloadId) -> LedgerResult<()>;

    /// Fetch a secret by name; `NotFound` if it does not exist
    async fn get_secret(&self, name: &str) -> LedgerResult<Secret>;

    /// Subscribe to node events
    fn watch_nodes(&self) -> broadcast::Receiver<NodeEvent>;

    /// Subscribe to workload events
    fn watch_workloads(&self) -> broadcast::Receiver<WorkloadEvent>;

    /// Namespace workloads and secrets are scoped to
    fn namespace(&self) -> &str;

    /// Backend name
    fn name(&self) -> &'static str;
}
