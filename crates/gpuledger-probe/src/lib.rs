//! gpuledger-probe: Hardware probe
//!
//! This crate queries a node's GPU inventory and per-slot memory capacity:
//! - `nvidia-smi` over SSH for real nodes
//! - Strict parsers for the `nvidia-smi` CSV output
//! - A static probe for development and tests

pub mod mock;
pub mod parse;
pub mod ssh;
pub mod traits;

pub use mock::StaticProbe;
pub use ssh::{SshProbe, SshProbeConfig};
pub use traits::{HardwareProbe, ProbeCredentials, SlotCapacity};
