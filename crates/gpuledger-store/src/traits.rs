//! Ledger store trait definitions

use async_trait::async_trait;
use gpuledger_core::{Binding, BindingRecord, CapacityRecord, LedgerResult, WorkloadId};
use std::collections::BTreeSet;

/// Ledger store holding one capacity record per (node, GPU slot).
///
/// Every mutation is a single atomic operation against the store. Callers
/// never read a record, decide, and write it back themselves.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Snapshot of all capacity records, ascending by node id then slot id
    async fn list_capacity(&self) -> LedgerResult<Vec<CapacityRecord>>;

    /// Insert a fresh record unless the key already exists.
    ///
    /// Returns `true` when this call inserted the record.
    async fn register_slot(
        &self,
        node_id: &str,
        slot_id: u32,
        total_capacity: u64,
    ) -> LedgerResult<bool>;

    /// Atomically add `amount` to a slot's used capacity if it fits
    async fn reserve(&self, node_id: &str, slot_id: u32, amount: u64)
        -> LedgerResult<CapacityRecord>;

    /// Atomically subtract `amount` from a slot's used capacity
    async fn release(&self, node_id: &str, slot_id: u32, amount: u64)
        -> LedgerResult<CapacityRecord>;

    /// Reserve `binding.amount` on the bound slot and persist the binding
    /// for `workload`, as one atomic step.
    ///
    /// Fails with `AlreadyExists` when the workload is already bound.
    async fn reserve_for(
        &self,
        workload: &WorkloadId,
        binding: &Binding,
    ) -> LedgerResult<BindingRecord>;

    /// Persisted binding of a workload, if any
    async fn binding(&self, workload: &WorkloadId) -> LedgerResult<Option<BindingRecord>>;

    /// All persisted bindings
    async fn list_bindings(&self) -> LedgerResult<Vec<BindingRecord>>;

    /// Atomically remove a workload's binding and release its amount.
    ///
    /// With `uid` set, only a binding from that reservation is removed.
    /// Returns the removed binding, or `None` when the workload holds no
    /// matching binding (never bound, already reclaimed, or bound again).
    async fn reclaim(
        &self,
        workload: &WorkloadId,
        uid: Option<&str>,
    ) -> LedgerResult<Option<BindingRecord>>;

    /// Record that every slot of a node is in the ledger
    async fn mark_node_registered(&self, node_id: &str) -> LedgerResult<()>;

    /// Nodes whose registration completed
    async fn registered_nodes(&self) -> LedgerResult<BTreeSet<String>>;

    /// Backend name
    fn name(&self) -> &'static str;
}
