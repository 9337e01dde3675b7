//! Static hardware probe for development and testing

use async_trait::async_trait;
use gpuledger_core::{LedgerError, LedgerResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::traits::{HardwareProbe, ProbeCredentials, SlotCapacity};

/// Probe answering from a fixed per-address inventory
pub struct StaticProbe {
    inventories: RwLock<HashMap<String, Vec<SlotCapacity>>>,
    calls: AtomicUsize,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self {
            inventories: RwLock::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Set the inventory reported for `address`
    pub async fn set_inventory(&self, address: &str, slots: &[(u32, u64)]) {
        let slots = slots
            .iter()
            .map(|&(slot_id, total_capacity)| SlotCapacity {
                slot_id,
                total_capacity,
            })
            .collect();
        self.inventories
            .write()
            .await
            .insert(address.to_string(), slots);
    }

    /// Number of probe calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareProbe for StaticProbe {
    async fn probe(
        &self,
        address: &str,
        _credentials: &ProbeCredentials,
    ) -> LedgerResult<Vec<SlotCapacity>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        debug!(address = address, "Static probe");

        self.inventories
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| LedgerError::ProbeUnreachable(format!("{}: no route to host", address)))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
