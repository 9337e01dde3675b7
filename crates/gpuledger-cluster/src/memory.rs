//! In-memory control plane for development and testing

use async_trait::async_trait;
use gpuledger_core::{
    LedgerError, LedgerResult, NodeEvent, NodeInfo, Secret, Workload, WorkloadEvent, WorkloadId,
    WorkloadPhase, WorkloadSpec,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::traits::ControlPlane;
use crate::EVENT_CHANNEL_CAPACITY;

/// Control plane keeping nodes, workloads and secrets in process memory
pub struct InMemoryCluster {
    namespace: String,
    nodes: RwLock<BTreeMap<String, NodeInfo>>,
    workloads: RwLock<BTreeMap<WorkloadId, Workload>>,
    secrets: RwLock<HashMap<String, Secret>>,
    /// Error returned by the next `create_workload`, if set
    create_failure: RwLock<Option<LedgerError>>,
    /// Delay applied to the next `create_workload`, if set
    create_delay: RwLock<Option<Duration>>,
    deletes: AtomicUsize,
    node_tx: broadcast::Sender<NodeEvent>,
    workload_tx: broadcast::Sender<WorkloadEvent>,
}

impl InMemoryCluster {
    /// Create an empty cluster scoped to `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        let (node_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (workload_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            namespace: namespace.into(),
            nodes: RwLock::new(BTreeMap::new()),
            workloads: RwLock::new(BTreeMap::new()),
            secrets: RwLock::new(HashMap::new()),
            create_failure: RwLock::new(None),
            create_delay: RwLock::new(None),
            deletes: AtomicUsize::new(0),
            node_tx,
            workload_tx,
        }
    }

    /// Add a node and announce it
    pub async fn add_node(&self, node: NodeInfo) {
        debug!(node = %node.name, "Node added");
        self.nodes
            .write()
            .await
            .insert(node.name.clone(), node.clone());
        let _ = self.node_tx.send(NodeEvent::Added(node));
    }

    /// Store a secret with the given key/value pairs
    pub async fn put_secret(&self, name: &str, data: &[(&str, &str)]) {
        let secret = Secret {
            name: name.to_string(),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.secrets.write().await.insert(name.to_string(), secret);
    }

    /// Move a workload to `phase` and announce the change
    pub async fn set_phase(&self, id: &WorkloadId, phase: WorkloadPhase) -> LedgerResult<()> {
        let workload = {
            let mut workloads = self.workloads.write().await;
            let workload = workloads
                .get_mut(id)
                .ok_or_else(|| LedgerError::NotFound(format!("workload {}", id)))?;
            workload.phase = phase;
            workload.clone()
        };
        let _ = self.workload_tx.send(WorkloadEvent::StatusChanged(workload));
        Ok(())
    }

    /// Make the next `create_workload` fail with `error`
    pub async fn fail_next_create(&self, error: LedgerError) {
        *self.create_failure.write().await = Some(error);
    }

    /// Make the next `create_workload` take at least `delay`
    pub async fn delay_next_create(&self, delay: Duration) {
        *self.create_delay.write().await = Some(delay);
    }

    /// Look up a workload by id
    pub async fn workload(&self, id: &WorkloadId) -> Option<Workload> {
        self.workloads.read().await.get(id).cloned()
    }

    /// Number of successful deletes so far
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new("default")
    }
}

#[async_trait]
impl ControlPlane for InMemoryCluster {
    async fn list_nodes(&self) -> LedgerResult<Vec<NodeInfo>> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn list_workloads(&self, selector: &str) -> LedgerResult<Vec<Workload>> {
        Ok(self
            .workloads
            .read()
            .await
            .values()
            .filter(|w| w.id.namespace == self.namespace && w.matches_selector(selector))
            .cloned()
            .collect())
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> LedgerResult<Workload> {
        let delay = self.create_delay.write().await.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.create_failure.write().await.take() {
            return Err(error);
        }

        let workload = {
            let mut workloads = self.workloads.write().await;
            if workloads.contains_key(&spec.id) {
                return Err(LedgerError::AlreadyExists(format!("workload {}", spec.id)));
            }
            let workload = Workload::from_spec(spec);
            workloads.insert(spec.id.clone(), workload.clone());
            workload
        };

        debug!(workload = %spec.id, binding = %spec.binding, "Workload created");
        let _ = self
            .workload_tx
            .send(WorkloadEvent::StatusChanged(workload.clone()));
        Ok(workload)
    }

    async fn delete_workload(&self, id: &WorkloadId) -> LedgerResult<()> {
        if self.workloads.write().await.remove(id).is_none() {
            return Err(LedgerError::NotFound(format!("workload {}", id)));
        }
        self.deletes.fetch_add(1, Ordering::Relaxed);
        debug!(workload = %id, "Workload deleted");
        let _ = self.workload_tx.send(WorkloadEvent::Deleted(id.clone()));
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> LedgerResult<Secret> {
        self.secrets
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("secret {}", name)))
    }

    fn watch_nodes(&self) -> broadcast::Receiver<NodeEvent> {
        self.node_tx.subscribe()
    }

    fn watch_workloads(&self) -> broadcast::Receiver<WorkloadEvent> {
        self.workload_tx.subscribe()
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
