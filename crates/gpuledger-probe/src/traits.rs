//! Hardware probe trait definitions

use async_trait::async_trait;
use gpuledger_core::LedgerResult;

/// Total VRAM of one GPU slot, in ledger units (GiB)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCapacity {
    pub slot_id: u32,
    pub total_capacity: u64,
}

/// Credentials for reaching a node
#[derive(Clone)]
pub struct ProbeCredentials {
    pub user: String,
    pub password: String,
}

impl ProbeCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for ProbeCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Probe returning a node's GPU slots and their memory capacity
#[async_trait]
pub trait HardwareProbe: Send + Sync {
    /// Query the GPU inventory of the node at `address`.
    ///
    /// Fails with `ProbeUnreachable`, `ProbeTimeout` or `ProbeParseError`;
    /// never returns a partial inventory.
    async fn probe(
        &self,
        address: &str,
        credentials: &ProbeCredentials,
    ) -> LedgerResult<Vec<SlotCapacity>>;

    /// Get the probe name
    fn name(&self) -> &'static str;
}
