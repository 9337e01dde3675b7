//! Capacity records and workload bindings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::WorkloadId;

/// Ledger row describing total and used VRAM for one GPU slot on one node.
///
/// `available` is stored redundantly for filtering; every constructor and
/// mutator keeps it equal to `used_capacity < total_capacity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRecord {
    /// Stable identifier of the node
    pub node_id: String,
    /// GPU index within the node
    pub slot_id: u32,
    /// Total VRAM units on this slot, immutable after creation
    pub total_capacity: u64,
    /// VRAM units currently reserved
    pub used_capacity: u64,
    /// Whether any VRAM remains on this slot
    pub available: bool,
}

impl CapacityRecord {
    /// Create a fresh, unused record
    pub fn new(node_id: impl Into<String>, slot_id: u32, total_capacity: u64) -> Self {
        Self {
            node_id: node_id.into(),
            slot_id,
            total_capacity,
            used_capacity: 0,
            available: total_capacity > 0,
        }
    }

    /// VRAM units still free on this slot
    pub fn remaining_capacity(&self) -> u64 {
        self.total_capacity - self.used_capacity
    }

    /// Whether this slot can take `amount` more units
    pub fn fits(&self, amount: u64) -> bool {
        self.available && self.remaining_capacity() >= amount
    }

    /// Add `amount` to the used capacity.
    ///
    /// Fails with `InsufficientCapacity` and leaves the record untouched when
    /// the slot cannot hold it.
    pub fn try_reserve(&mut self, amount: u64) -> crate::LedgerResult<()> {
        let remaining = self.remaining_capacity();
        if amount > remaining {
            return Err(crate::LedgerError::InsufficientCapacity {
                node_id: self.node_id.clone(),
                slot_id: self.slot_id,
                requested: amount,
                remaining,
            });
        }
        self.used_capacity += amount;
        self.available = self.used_capacity < self.total_capacity;
        Ok(())
    }

    /// Subtract `amount` from the used capacity.
    ///
    /// Fails with `OverRelease` and leaves the record untouched when more
    /// than the used amount is returned.
    pub fn try_release(&mut self, amount: u64) -> crate::LedgerResult<()> {
        if amount > self.used_capacity {
            return Err(crate::LedgerError::OverRelease {
                node_id: self.node_id.clone(),
                slot_id: self.slot_id,
                requested: amount,
                used: self.used_capacity,
            });
        }
        self.used_capacity -= amount;
        self.available = self.used_capacity < self.total_capacity;
        Ok(())
    }

    /// Ledger order: ascending by node id, then slot id
    pub fn ledger_order(&self, other: &Self) -> Ordering {
        self.node_id
            .cmp(&other.node_id)
            .then(self.slot_id.cmp(&other.slot_id))
    }
}

/// The (node, slot, amount) a workload was granted
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub node_id: String,
    pub slot_id: u32,
    pub amount: u64,
}

impl Binding {
    pub fn new(node_id: impl Into<String>, slot_id: u32, amount: u64) -> Self {
        Self {
            node_id: node_id.into(),
            slot_id,
            amount,
        }
    }
}

impl std::fmt::Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} x{}", self.node_id, self.slot_id, self.amount)
    }
}

/// A binding persisted in the ledger for one workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub workload: WorkloadId,
    pub binding: Binding,
    /// Unique per reservation. A workload name can be bound again after a
    /// reclaim, the uid tells the two bindings apart.
    pub uid: String,
    pub bound_at: DateTime<Utc>,
}

impl BindingRecord {
    pub fn new(workload: WorkloadId, binding: Binding) -> Self {
        Self {
            workload,
            binding,
            uid: Uuid::new_v4().to_string(),
            bound_at: Utc::now(),
        }
    }

    /// Whether this record belongs to the reservation identified by `uid`.
    ///
    /// `None` matches any record.
    pub fn matches_uid(&self, uid: Option<&str>) -> bool {
        uid.map_or(true, |uid| self.uid == uid)
    }
}
