//! Workload, node and cluster event type definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Binding;

/// Identity of a workload: namespace-like scope plus name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadId {
    pub namespace: String,
    pub name: String,
}

impl WorkloadId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Workload phase as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl WorkloadPhase {
    /// Whether the workload has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }

    /// Parse a control plane phase string; unknown phases map to `None`
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(WorkloadPhase::Pending),
            "Running" => Some(WorkloadPhase::Running),
            "Succeeded" => Some(WorkloadPhase::Succeeded),
            "Failed" => Some(WorkloadPhase::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadPhase::Pending => write!(f, "Pending"),
            WorkloadPhase::Running => write!(f, "Running"),
            WorkloadPhase::Succeeded => write!(f, "Succeeded"),
            WorkloadPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Specification submitted to the control plane for a new workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub id: WorkloadId,
    /// Container image reference
    pub image: String,
    /// Node, slot and VRAM amount the workload is pinned to
    pub binding: Binding,
    /// Uid of the ledger reservation backing `binding`
    pub binding_uid: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl WorkloadSpec {
    pub fn new(id: WorkloadId, image: impl Into<String>, binding: Binding) -> Self {
        Self {
            id,
            image: image.into(),
            binding,
            binding_uid: None,
            labels: BTreeMap::new(),
        }
    }

    /// Tie the spec to a ledger reservation
    pub fn with_binding_uid(mut self, uid: impl Into<String>) -> Self {
        self.binding_uid = Some(uid.into());
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Observed state of a workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    /// Node the workload is placed on, if any
    pub node_id: Option<String>,
    pub phase: WorkloadPhase,
    /// Binding recorded on the workload itself, if any
    pub binding: Option<Binding>,
    /// Reservation uid recorded on the workload, if any
    pub binding_uid: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Workload {
    /// Build the initial observed state of a freshly submitted spec
    pub fn from_spec(spec: &WorkloadSpec) -> Self {
        Self {
            id: spec.id.clone(),
            node_id: Some(spec.binding.node_id.clone()),
            phase: WorkloadPhase::Pending,
            binding: Some(spec.binding.clone()),
            binding_uid: spec.binding_uid.clone(),
            labels: spec.labels.clone(),
        }
    }

    /// Whether the workload matches a `key=value[,key=value]` label selector
    pub fn matches_selector(&self, selector: &str) -> bool {
        matches_selector(&self.labels, selector)
    }
}

/// A cluster node as seen by the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    /// Internal address used to reach the node
    pub address: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>, address: Option<String>) -> Self {
        Self {
            name: name.into(),
            address,
            labels: BTreeMap::new(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether the node carries the GPU-capable marker label
    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).map(String::as_str) == Some(value)
    }
}

/// Credential material stored in the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    /// Decoded key/value pairs
    pub data: BTreeMap<String, String>,
}

/// Node lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Added(NodeInfo),
}

/// Workload lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadEvent {
    StatusChanged(Workload),
    Deleted(WorkloadId),
}

/// Check a label map against a `key=value[,key=value]` selector.
///
/// An empty selector matches everything.
pub fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => labels.contains_key(term),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_id_display() {
        let id = WorkloadId::new("xrcloud", "train-1");
        assert_eq!(id.to_string(), "xrcloud/train-1");
    }

    #[test]
    fn test_phase_parse_and_terminal() {
        assert_eq!(WorkloadPhase::parse("Succeeded"), Some(WorkloadPhase::Succeeded));
        assert_eq!(WorkloadPhase::parse("Unknown"), None);
        assert!(WorkloadPhase::Failed.is_terminal());
        assert!(!WorkloadPhase::Running.is_terminal());
    }

    #[test]
    fn test_workload_from_spec() {
        let spec = WorkloadSpec::new(
            WorkloadId::new("xrcloud", "job"),
            "busybox",
            Binding::new("node-a", 0, 4),
        )
        .with_binding_uid("r-1")
        .with_label("app", "gpushare");
        let workload = Workload::from_spec(&spec);
        assert_eq!(workload.binding_uid.as_deref(), Some("r-1"));
        assert_eq!(workload.phase, WorkloadPhase::Pending);
        assert_eq!(workload.node_id.as_deref(), Some("node-a"));
        assert_eq!(workload.binding, Some(Binding::new("node-a", 0, 4)));
    }

    #[test]
    fn test_selector_matching() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "gpushare".to_string());
        labels.insert("tier".to_string(), "batch".to_string());

        assert!(matches_selector(&labels, "app=gpushare"));
        assert!(matches_selector(&labels, "app=gpushare, tier=batch"));
        assert!(matches_selector(&labels, "tier"));
        assert!(matches_selector(&labels, ""));
        assert!(!matches_selector(&labels, "app=other"));
        assert!(!matches_selector(&labels, "missing"));
    }

    #[test]
    fn test_node_gpu_label() {
        let node = NodeInfo::new("node-a", Some("10.0.0.5".to_string())).with_label("gpushare", "true");
        assert!(node.has_label("gpushare", "true"));
        assert!(!node.has_label("gpushare", "false"));
    }
}
