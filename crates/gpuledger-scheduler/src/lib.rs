//! gpuledger-scheduler: VRAM allocation for gpuledger
//!
//! This crate decides where a VRAM request lands:
//! - Placement strategies over a ledger snapshot
//! - The allocation coordinator with bounded re-scan on lost races
//! - Reservation guards that release on cancellation

pub mod coordinator;
pub mod placement;

pub use coordinator::{AllocationCoordinator, Reservation, RetryPolicy};
pub use placement::{FirstFit, PlacementStrategy};
