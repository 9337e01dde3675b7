//! gpuledger-core: Core types for the GPU memory ledger
//!
//! This crate provides the fundamental types used throughout gpuledger:
//! - Capacity records and workload bindings
//! - Workload, node and cluster event types
//! - Configuration types
//! - Error handling

pub mod capacity;
pub mod config;
pub mod error;
pub mod workload;

pub use self::capacity::*;
pub use self::config::*;
pub use self::error::*;
pub use self::workload::*;
