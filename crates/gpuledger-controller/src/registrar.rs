//! Node registrar
//!
//! Turns GPU-capable cluster nodes into ledger capacity records. Each node
//! moves through probing to registered; a failed attempt forgets the node
//! so a later event or rescan can retry it. A node counts as registered only
//! once the ledger has recorded its completion, so a node interrupted halfway
//! is probed again after a restart.

use gpuledger_cluster::ControlPlane;
use gpuledger_core::{LedgerError, LedgerResult, NodeInfo};
use gpuledger_probe::{HardwareProbe, ProbeCredentials};
use gpuledger_store::LedgerStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::credentials::CredentialWaiter;

/// Registration progress of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting for credentials or probing hardware
    Probing,
    /// Inventory known, slots being registered
    Probed,
    /// Every slot is in the ledger
    Registered,
}

/// Result of handling one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Slots registered; `inserted` counts the ones that were new
    Registered { slots: usize, inserted: usize },
    AlreadyRegistered,
    /// Another task is registering this node
    InProgress,
    NotGpuCapable,
}

/// Registers GPU-capable nodes into the ledger
pub struct NodeRegistrar {
    store: Arc<dyn LedgerStore>,
    plane: Arc<dyn ControlPlane>,
    probe: Arc<dyn HardwareProbe>,
    credentials: CredentialWaiter,
    ssh_user: String,
    gpu_label: (String, String),
    /// Node registration set
    nodes: Mutex<HashMap<String, NodeState>>,
}

impl NodeRegistrar {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        plane: Arc<dyn ControlPlane>,
        probe: Arc<dyn HardwareProbe>,
        credentials: CredentialWaiter,
        ssh_user: impl Into<String>,
        gpu_label: (String, String),
    ) -> Self {
        Self {
            store,
            plane,
            probe,
            credentials,
            ssh_user: ssh_user.into(),
            gpu_label,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of a node, if it is known
    pub async fn state(&self, node: &str) -> Option<NodeState> {
        self.nodes.lock().await.get(node).copied()
    }

    /// Seed the registration set with the nodes the ledger marks complete,
    /// then register every other GPU-capable node
    pub async fn bootstrap(self: &Arc<Self>) -> LedgerResult<Vec<JoinHandle<()>>> {
        let known = self.store.registered_nodes().await?;
        {
            let mut nodes = self.nodes.lock().await;
            for node in &known {
                nodes.insert(node.clone(), NodeState::Registered);
            }
        }
        info!(registered = known.len(), "Loaded registered nodes from ledger");

        self.rescan().await
    }

    /// List cluster nodes and register the unknown GPU-capable ones.
    ///
    /// Nodes forgotten after a failed attempt are unknown again, so a
    /// periodic rescan retries them.
    pub async fn rescan(self: &Arc<Self>) -> LedgerResult<Vec<JoinHandle<()>>> {
        let cluster_nodes = self.plane.list_nodes().await?;

        let mut handles = Vec::new();
        for node in cluster_nodes {
            if !self.is_gpu_capable(&node) || self.state(&node.name).await.is_some() {
                continue;
            }
            handles.push(self.spawn_handle(node));
        }
        Ok(handles)
    }

    /// Handle a node in the background so slow nodes do not block others
    pub fn spawn_handle(self: &Arc<Self>, node: NodeInfo) -> JoinHandle<()> {
        let registrar = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = registrar.handle_node(&node).await {
                warn!(node = %node.name, error = %e, "Node registration failed, will retry on next rescan");
            }
        })
    }

    /// Register a node's GPU slots unless it is already registered
    pub async fn handle_node(&self, node: &NodeInfo) -> LedgerResult<RegistrationOutcome> {
        if !self.is_gpu_capable(node) {
            debug!(node = %node.name, "Skipping node without GPU label");
            return Ok(RegistrationOutcome::NotGpuCapable);
        }

        {
            let mut nodes = self.nodes.lock().await;
            match nodes.get(&node.name) {
                Some(NodeState::Registered) => return Ok(RegistrationOutcome::AlreadyRegistered),
                Some(_) => return Ok(RegistrationOutcome::InProgress),
                None => {
                    nodes.insert(node.name.clone(), NodeState::Probing);
                }
            }
        }

        match self.register(node).await {
            Ok(outcome) => {
                self.nodes
                    .lock()
                    .await
                    .insert(node.name.clone(), NodeState::Registered);
                Ok(outcome)
            }
            Err(e) => {
                self.nodes.lock().await.remove(&node.name);
                Err(e)
            }
        }
    }

    async fn register(&self, node: &NodeInfo) -> LedgerResult<RegistrationOutcome> {
        let address = node.address.as_deref().ok_or_else(|| {
            LedgerError::ProbeUnreachable(format!("node {} has no address", node.name))
        })?;

        info!(node = %node.name, address = address, "Registering node");
        let password = self.credentials.wait(&node.name).await?;
        let credentials = ProbeCredentials::new(self.ssh_user.clone(), password);

        let slots = self.probe.probe(address, &credentials).await?;
        self.nodes
            .lock()
            .await
            .insert(node.name.clone(), NodeState::Probed);

        let mut inserted = 0;
        for slot in &slots {
            if self
                .store
                .register_slot(&node.name, slot.slot_id, slot.total_capacity)
                .await?
            {
                inserted += 1;
            }
        }
        self.store.mark_node_registered(&node.name).await?;

        info!(
            node = %node.name,
            slots = slots.len(),
            inserted = inserted,
            "Node registered"
        );
        Ok(RegistrationOutcome::Registered {
            slots: slots.len(),
            inserted,
        })
    }

    fn is_gpu_capable(&self, node: &NodeInfo) -> bool {
        node.has_label(&self.gpu_label.0, &self.gpu_label.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuledger_cluster::InMemoryCluster;
    use gpuledger_probe::StaticProbe;
    use gpuledger_store::MemoryLedger;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryLedger>,
        cluster: Arc<InMemoryCluster>,
        probe: Arc<StaticProbe>,
        registrar: Arc<NodeRegistrar>,
    }

    fn fixture(credential_timeout: Duration) -> Fixture {
        let store = Arc::new(MemoryLedger::new());
        let cluster = Arc::new(InMemoryCluster::new("xrcloud"));
        let probe = Arc::new(StaticProbe::new());
        let credentials = CredentialWaiter::new(
            cluster.clone(),
            "-root-password",
            "password",
            Duration::from_millis(5),
            credential_timeout,
        );
        let registrar = Arc::new(NodeRegistrar::new(
            store.clone(),
            cluster.clone(),
            probe.clone(),
            credentials,
            "root",
            ("gpushare".to_string(), "true".to_string()),
        ));
        Fixture {
            store,
            cluster,
            probe,
            registrar,
        }
    }

    fn gpu_node(name: &str, address: &str) -> NodeInfo {
        NodeInfo::new(name, Some(address.to_string())).with_label("gpushare", "true")
    }

    #[tokio::test]
    async fn test_register_node() {
        let f = fixture(Duration::from_millis(100));
        f.probe.set_inventory("10.0.0.5", &[(0, 24), (1, 16)]).await;
        f.cluster
            .put_secret("gpu-node-1-root-password", &[("password", "pw")])
            .await;

        let outcome = f
            .registrar
            .handle_node(&gpu_node("gpu-node-1", "10.0.0.5"))
            .await
            .unwrap();
        assert_eq!(outcome, RegistrationOutcome::Registered { slots: 2, inserted: 2 });
        assert_eq!(f.registrar.state("gpu-node-1").await, Some(NodeState::Registered));

        let records = f.store.list_capacity().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].total_capacity, 24);
        assert_eq!(records[1].used_capacity, 0);
        assert!(f
            .store
            .registered_nodes()
            .await
            .unwrap()
            .contains("gpu-node-1"));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let f = fixture(Duration::from_millis(100));
        f.probe.set_inventory("10.0.0.5", &[(0, 24)]).await;
        f.cluster
            .put_secret("gpu-node-1-root-password", &[("password", "pw")])
            .await;
        let node = gpu_node("gpu-node-1", "10.0.0.5");

        f.registrar.handle_node(&node).await.unwrap();
        let second = f.registrar.handle_node(&node).await.unwrap();
        assert_eq!(second, RegistrationOutcome::AlreadyRegistered);
        assert_eq!(f.probe.calls(), 1);
        assert_eq!(f.store.list_capacity().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_gpu_node_is_skipped() {
        let f = fixture(Duration::from_millis(100));
        let node = NodeInfo::new("cpu-node", Some("10.0.0.9".to_string()));

        let outcome = f.registrar.handle_node(&node).await.unwrap();
        assert_eq!(outcome, RegistrationOutcome::NotGpuCapable);
        assert_eq!(f.registrar.state("cpu-node").await, None);
        assert_eq!(f.probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_credential_timeout_leaves_node_retryable() {
        let f = fixture(Duration::from_millis(20));
        f.probe.set_inventory("10.0.0.5", &[(0, 24)]).await;
        let node = gpu_node("gpu-node-1", "10.0.0.5");

        let err = f.registrar.handle_node(&node).await.unwrap_err();
        assert!(matches!(err, LedgerError::CredentialTimeout { .. }));
        assert_eq!(f.registrar.state("gpu-node-1").await, None);
        assert_eq!(f.probe.calls(), 0);

        f.cluster
            .put_secret("gpu-node-1-root-password", &[("password", "pw")])
            .await;
        let outcome = f.registrar.handle_node(&node).await.unwrap();
        assert!(matches!(outcome, RegistrationOutcome::Registered { .. }));
    }

    #[tokio::test]
    async fn test_probe_failure_leaves_node_retryable() {
        let f = fixture(Duration::from_millis(100));
        f.cluster
            .put_secret("gpu-node-1-root-password", &[("password", "pw")])
            .await;
        let node = gpu_node("gpu-node-1", "10.0.0.5");

        let err = f.registrar.handle_node(&node).await.unwrap_err();
        assert!(matches!(err, LedgerError::ProbeUnreachable(_)));
        assert_eq!(f.registrar.state("gpu-node-1").await, None);
        assert!(f.store.list_capacity().await.unwrap().is_empty());

        f.probe.set_inventory("10.0.0.5", &[(0, 8)]).await;
        assert!(f.registrar.handle_node(&node).await.is_ok());
    }

    #[tokio::test]
    async fn test_bootstrap_skips_ledger_nodes() {
        let f = fixture(Duration::from_millis(100));
        f.store.register_slot("gpu-node-1", 0, 24).await.unwrap();
        f.store.mark_node_registered("gpu-node-1").await.unwrap();
        f.probe.set_inventory("10.0.0.6", &[(0, 16)]).await;
        f.cluster
            .put_secret("gpu-node-2-root-password", &[("password", "pw")])
            .await;
        f.cluster.add_node(gpu_node("gpu-node-1", "10.0.0.5")).await;
        f.cluster.add_node(gpu_node("gpu-node-2", "10.0.0.6")).await;
        f.cluster
            .add_node(NodeInfo::new("cpu-node", Some("10.0.0.9".to_string())))
            .await;

        let handles = f.registrar.bootstrap().await.unwrap();
        assert_eq!(handles.len(), 1);
        futures::future::join_all(handles).await;

        assert_eq!(f.probe.calls(), 1);
        assert_eq!(f.registrar.state("gpu-node-2").await, Some(NodeState::Registered));
        let nodes = f.store.registered_nodes().await.unwrap();
        assert!(nodes.contains("gpu-node-1") && nodes.contains("gpu-node-2"));
    }

    #[tokio::test]
    async fn test_bootstrap_completes_partial_node() {
        let f = fixture(Duration::from_millis(100));
        // Slot 0 landed before a restart, slot 1 did not
        f.store.register_slot("gpu-node-1", 0, 24).await.unwrap();
        f.probe.set_inventory("10.0.0.5", &[(0, 24), (1, 16)]).await;
        f.cluster
            .put_secret("gpu-node-1-root-password", &[("password", "pw")])
            .await;
        f.cluster.add_node(gpu_node("gpu-node-1", "10.0.0.5")).await;

        let handles = f.registrar.bootstrap().await.unwrap();
        assert_eq!(handles.len(), 1);
        futures::future::join_all(handles).await;

        assert_eq!(f.registrar.state("gpu-node-1").await, Some(NodeState::Registered));
        let records = f.store.list_capacity().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].total_capacity, 16);
        assert!(f
            .store
            .registered_nodes()
            .await
            .unwrap()
            .contains("gpu-node-1"));
    }
}
