//! gpuledger-api: HTTP API for gpuledger
//!
//! This crate provides the HTTP surface of the ledger:
//! - Workload admission (`POST /create`)
//! - Capacity listing
//! - System status

pub mod rest;

pub use rest::{create_router, AppState};
