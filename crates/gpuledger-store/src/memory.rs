//! In-memory ledger store
//!
//! Each (node, slot) record sits behind its own mutex so reservations on
//! different slots never contend. The record map lock is only held long
//! enough to find or insert a record.

use async_trait::async_trait;
use gpuledger_core::{
    Binding, BindingRecord, CapacityRecord, LedgerError, LedgerResult, WorkloadId,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::traits::LedgerStore;

type SlotKey = (String, u32);
type RecordsMap = BTreeMap<SlotKey, Arc<Mutex<CapacityRecord>>>;
type BindingsMap = HashMap<WorkloadId, BindingRecord>;

/// Process-local ledger store
pub struct MemoryLedger {
    /// Capacity records indexed by (node, slot)
    records: RwLock<RecordsMap>,
    /// Persisted bindings indexed by workload.
    ///
    /// Lock order: bindings, then records, then a single record.
    bindings: Mutex<BindingsMap>,
    /// Nodes whose registration completed
    nodes: Mutex<BTreeSet<String>>,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            bindings: Mutex::new(HashMap::new()),
            nodes: Mutex::new(BTreeSet::new()),
        }
    }

    async fn record(&self, node_id: &str, slot_id: u32) -> LedgerResult<Arc<Mutex<CapacityRecord>>> {
        let records = self.records.read().await;
        records
            .get(&(node_id.to_string(), slot_id))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("capacity record {}/{}", node_id, slot_id)))
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn list_capacity(&self) -> LedgerResult<Vec<CapacityRecord>> {
        let handles: Vec<Arc<Mutex<CapacityRecord>>> =
            self.records.read().await.values().cloned().collect();

        let mut snapshot = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshot.push(handle.lock().await.clone());
        }
        Ok(snapshot)
    }

    async fn register_slot(
        &self,
        node_id: &str,
        slot_id: u32,
        total_capacity: u64,
    ) -> LedgerResult<bool> {
        let mut records = self.records.write().await;
        let key = (node_id.to_string(), slot_id);
        if records.contains_key(&key) {
            debug!(node_id = node_id, slot_id = slot_id, "Slot already registered");
            return Ok(false);
        }

        records.insert(
            key,
            Arc::new(Mutex::new(CapacityRecord::new(node_id, slot_id, total_capacity))),
        );
        info!(
            node_id = node_id,
            slot_id = slot_id,
            total_capacity = total_capacity,
            "Registered GPU slot"
        );
        Ok(true)
    }

    async fn reserve(
        &self,
        node_id: &str,
        slot_id: u32,
        amount: u64,
    ) -> LedgerResult<CapacityRecord> {
        let handle = self.record(node_id, slot_id).await?;
        let mut record = handle.lock().await;
        record.try_reserve(amount)?;
        debug!(
            node_id = node_id,
            slot_id = slot_id,
            amount = amount,
            used = record.used_capacity,
            "Reserved VRAM"
        );
        Ok(record.clone())
    }

    async fn release(
        &self,
        node_id: &str,
        slot_id: u32,
        amount: u64,
    ) -> LedgerResult<CapacityRecord> {
        let handle = self.record(node_id, slot_id).await?;
        let mut record = handle.lock().await;
        record.try_release(amount)?;
        debug!(
            node_id = node_id,
            slot_id = slot_id,
            amount = amount,
            used = record.used_capacity,
            "Released VRAM"
        );
        Ok(record.clone())
    }

    async fn reserve_for(
        &self,
        workload: &WorkloadId,
        binding: &Binding,
    ) -> LedgerResult<BindingRecord> {
        let mut bindings = self.bindings.lock().await;
        if bindings.contains_key(workload) {
            return Err(LedgerError::AlreadyExists(format!(
                "binding for workload {}",
                workload
            )));
        }

        self.reserve(&binding.node_id, binding.slot_id, binding.amount)
            .await?;

        let record = BindingRecord::new(workload.clone(), binding.clone());
        bindings.insert(workload.clone(), record.clone());
        Ok(record)
    }

    async fn binding(&self, workload: &WorkloadId) -> LedgerResult<Option<BindingRecord>> {
        Ok(self.bindings.lock().await.get(workload).cloned())
    }

    async fn list_bindings(&self) -> LedgerResult<Vec<BindingRecord>> {
        let mut bindings: Vec<BindingRecord> =
            self.bindings.lock().await.values().cloned().collect();
        bindings.sort_by(|a, b| a.workload.cmp(&b.workload));
        Ok(bindings)
    }

    async fn reclaim(
        &self,
        workload: &WorkloadId,
        uid: Option<&str>,
    ) -> LedgerResult<Option<BindingRecord>> {
        let mut bindings = self.bindings.lock().await;
        let Some(record) = bindings.get(workload).cloned() else {
            return Ok(None);
        };
        if !record.matches_uid(uid) {
            debug!(workload = %workload, "Binding belongs to another reservation");
            return Ok(None);
        }

        let binding = &record.binding;
        self.release(&binding.node_id, binding.slot_id, binding.amount)
            .await?;
        bindings.remove(workload);
        Ok(Some(record))
    }

    async fn mark_node_registered(&self, node_id: &str) -> LedgerResult<()> {
        self.nodes.lock().await.insert(node_id.to_string());
        Ok(())
    }

    async fn registered_nodes(&self) -> LedgerResult<BTreeSet<String>> {
        Ok(self.nodes.lock().await.clone())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_register_slot_is_idempotent() {
        let ledger = MemoryLedger::new();
        assert!(ledger.register_slot("node-a", 0, 16).await.unwrap());
        ledger.reserve("node-a", 0, 4).await.unwrap();

        assert!(!ledger.register_slot("node-a", 0, 32).await.unwrap());

        let snapshot = ledger.list_capacity().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].total_capacity, 16);
        assert_eq!(snapshot[0].used_capacity, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_inserts_once() {
        let ledger = Arc::new(MemoryLedger::new());
        let tasks = (0..16).map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.register_slot("node-a", 0, 16).await.unwrap() })
        });

        let inserted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_list_capacity_is_ordered() {
        let ledger = MemoryLedger::new();
        ledger.register_slot("node-b", 0, 8).await.unwrap();
        ledger.register_slot("node-a", 10, 8).await.unwrap();
        ledger.register_slot("node-a", 2, 8).await.unwrap();

        let keys: Vec<(String, u32)> = ledger
            .list_capacity()
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.node_id, r.slot_id))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("node-a".to_string(), 2),
                ("node-a".to_string(), 10),
                ("node-b".to_string(), 0)
            ]
        );
    }

    #[tokio::test]
    async fn test_reserve_errors() {
        let ledger = MemoryLedger::new();
        ledger.register_slot("node-a", 0, 8).await.unwrap();

        let err = ledger.reserve("node-x", 0, 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));

        let err = ledger.reserve("node-a", 0, 9).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCapacity { .. }));

        let record = ledger.reserve("node-a", 0, 8).await.unwrap();
        assert!(!record.available);
    }

    #[tokio::test]
    async fn test_release_then_reserve_round_trip() {
        let ledger = MemoryLedger::new();
        ledger.register_slot("node-a", 0, 16).await.unwrap();
        ledger.reserve("node-a", 0, 10).await.unwrap();

        ledger.release("node-a", 0, 6).await.unwrap();
        let record = ledger.reserve("node-a", 0, 6).await.unwrap();
        assert_eq!(record.used_capacity, 10);

        let err = ledger.release("node-a", 0, 11).await.unwrap_err();
        assert!(matches!(err, LedgerError::OverRelease { used: 10, .. }));
    }

    #[tokio::test]
    async fn test_reserve_for_and_reclaim() {
        let ledger = MemoryLedger::new();
        ledger.register_slot("node-a", 0, 16).await.unwrap();
        let workload = WorkloadId::new("xrcloud", "job-1");
        let binding = Binding::new("node-a", 0, 6);

        ledger.reserve_for(&workload, &binding).await.unwrap();
        assert_eq!(ledger.list_capacity().await.unwrap()[0].used_capacity, 6);

        let err = ledger.reserve_for(&workload, &binding).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists(_)));
        assert_eq!(ledger.list_capacity().await.unwrap()[0].used_capacity, 6);

        let reclaimed = ledger.reclaim(&workload, None).await.unwrap().unwrap();
        assert_eq!(reclaimed.binding, binding);
        assert_eq!(ledger.list_capacity().await.unwrap()[0].used_capacity, 0);

        assert!(ledger.reclaim(&workload, None).await.unwrap().is_none());
        assert_eq!(ledger.list_capacity().await.unwrap()[0].used_capacity, 0);
    }

    #[tokio::test]
    async fn test_reserve_for_failure_leaves_no_binding() {
        let ledger = MemoryLedger::new();
        ledger.register_slot("node-a", 0, 4).await.unwrap();
        let workload = WorkloadId::new("xrcloud", "big");

        let err = ledger
            .reserve_for(&workload, &Binding::new("node-a", 0, 8))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCapacity { .. }));
        assert!(ledger.binding(&workload).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reclaim_matches_reservation_uid() {
        let ledger = MemoryLedger::new();
        ledger.register_slot("node-a", 0, 16).await.unwrap();
        let workload = WorkloadId::new("xrcloud", "job-1");
        let binding = Binding::new("node-a", 0, 6);

        let first = ledger.reserve_for(&workload, &binding).await.unwrap();
        ledger.reclaim(&workload, Some(&first.uid)).await.unwrap().unwrap();
        let second = ledger.reserve_for(&workload, &binding).await.unwrap();

        assert!(ledger
            .reclaim(&workload, Some(&first.uid))
            .await
            .unwrap()
            .is_none());
        assert_eq!(ledger.list_capacity().await.unwrap()[0].used_capacity, 6);

        let reclaimed = ledger
            .reclaim(&workload, Some(&second.uid))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.uid, second.uid);
        assert_eq!(ledger.list_capacity().await.unwrap()[0].used_capacity, 0);
    }

    #[tokio::test]
    async fn test_registered_nodes_only_lists_completed() {
        let ledger = MemoryLedger::new();
        ledger.register_slot("node-a", 0, 8).await.unwrap();
        ledger.register_slot("node-a", 1, 8).await.unwrap();
        ledger.register_slot("node-b", 0, 8).await.unwrap();
        ledger.mark_node_registered("node-a").await.unwrap();
        ledger.mark_node_registered("node-a").await.unwrap();

        let nodes = ledger.registered_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes.contains("node-a"));
        assert!(!nodes.contains("node-b"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(u64),
        Release(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..24).prop_map(Op::Reserve),
            (0u64..24).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn prop_used_capacity_stays_in_range(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let ledger = MemoryLedger::new();
                ledger.register_slot("node-a", 0, 16).await.unwrap();
                let mut expected = 0u64;

                for op in ops {
                    match op {
                        Op::Reserve(amount) => {
                            let ok = ledger.reserve("node-a", 0, amount).await.is_ok();
                            assert_eq!(ok, expected + amount <= 16);
                            if ok {
                                expected += amount;
                            }
                        }
                        Op::Release(amount) => {
                            let ok = ledger.release("node-a", 0, amount).await.is_ok();
                            assert_eq!(ok, amount <= expected);
                            if ok {
                                expected -= amount;
                            }
                        }
                    }

                    let record = &ledger.list_capacity().await.unwrap()[0];
                    assert!(record.used_capacity <= record.total_capacity);
                    assert_eq!(record.used_capacity, expected);
                    assert_eq!(record.available, record.used_capacity < record.total_capacity);
                }
            });
        }
    }
}
