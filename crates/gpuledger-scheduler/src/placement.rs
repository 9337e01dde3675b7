//! Slot placement decisions

use gpuledger_core::CapacityRecord;

/// Strategy for picking a slot out of a ledger snapshot
pub trait PlacementStrategy: Send + Sync {
    /// Pick a slot able to hold `amount`, or `None` if nothing fits
    fn select<'a>(&self, snapshot: &'a [CapacityRecord], amount: u64)
        -> Option<&'a CapacityRecord>;
}

/// First slot in (node id, slot id) order with enough remaining capacity
pub struct FirstFit;

impl PlacementStrategy for FirstFit {
    fn select<'a>(
        &self,
        snapshot: &'a [CapacityRecord],
        amount: u64,
    ) -> Option<&'a CapacityRecord> {
        snapshot
            .iter()
            .filter(|record| record.fits(amount))
            .min_by(|a, b| a.ledger_order(b))
    }
}
