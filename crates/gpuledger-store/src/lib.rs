//! gpuledger-store: Ledger store
//!
//! This crate provides the durable table of per-GPU-slot capacity records:
//! - The `LedgerStore` trait with atomic reserve/release operations
//! - An in-memory backend with per-record locking
//! - A PostgreSQL backend using conditional updates and transactions

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;
pub use traits::LedgerStore;
