//! List-and-diff state for polling watchers

use gpuledger_core::{NodeEvent, NodeInfo, Workload, WorkloadEvent, WorkloadId, WorkloadPhase};
use std::collections::{HashMap, HashSet};

/// What a polling watcher has already reported
#[derive(Debug, Default)]
pub struct WatchState {
    nodes: HashSet<String>,
    workloads: HashMap<WorkloadId, WorkloadPhase>,
}

impl WatchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events for nodes not seen in earlier polls
    pub fn diff_nodes(&mut self, nodes: Vec<NodeInfo>) -> Vec<NodeEvent> {
        nodes
            .into_iter()
            .filter(|node| self.nodes.insert(node.name.clone()))
            .map(NodeEvent::Added)
            .collect()
    }

    /// Events for new workloads, phase changes and disappeared workloads
    pub fn diff_workloads(&mut self, workloads: Vec<Workload>) -> Vec<WorkloadEvent> {
        let mut events = Vec::new();
        let mut present = HashSet::with_capacity(workloads.len());

        for workload in workloads {
            present.insert(workload.id.clone());
            let previous = self.workloads.insert(workload.id.clone(), workload.phase);
            if previous != Some(workload.phase) {
                events.push(WorkloadEvent::StatusChanged(workload));
            }
        }

        let gone: Vec<WorkloadId> = self
            .workloads
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            self.workloads.remove(&id);
            events.push(WorkloadEvent::Deleted(id));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn workload(name: &str, phase: WorkloadPhase) -> Workload {
        Workload {
            id: WorkloadId::new("xrcloud", name),
            node_id: Some("node-a".to_string()),
            phase,
            binding: None,
            binding_uid: None,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_diff_nodes_reports_each_node_once() {
        let mut state = WatchState::new();
        let nodes = vec![NodeInfo::new("node-a", None), NodeInfo::new("node-b", None)];

        assert_eq!(state.diff_nodes(nodes.clone()).len(), 2);
        assert!(state.diff_nodes(nodes).is_empty());

        let events = state.diff_nodes(vec![NodeInfo::new("node-c", None)]);
        assert_eq!(events, vec![NodeEvent::Added(NodeInfo::new("node-c", None))]);
    }

    #[test]
    fn test_diff_workloads_phase_changes_and_deletes() {
        let mut state = WatchState::new();

        let events = state.diff_workloads(vec![workload("a", WorkloadPhase::Pending)]);
        assert_eq!(events.len(), 1);

        assert!(state
            .diff_workloads(vec![workload("a", WorkloadPhase::Pending)])
            .is_empty());

        let events = state.diff_workloads(vec![workload("a", WorkloadPhase::Succeeded)]);
        assert!(matches!(
            &events[..],
            [WorkloadEvent::StatusChanged(w)] if w.phase == WorkloadPhase::Succeeded
        ));

        let events = state.diff_workloads(vec![]);
        assert_eq!(
            events,
            vec![WorkloadEvent::Deleted(WorkloadId::new("xrcloud", "a"))]
        );
    }
}
