//! gpuledger-cluster: Cluster control plane
//!
//! This crate provides the control plane the ledger collaborates with:
//! - The `ControlPlane` trait and node/workload event feeds
//! - An in-memory control plane for development and tests
//! - A Kubernetes REST backend with a polling watcher

pub mod kube;
pub mod memory;
pub mod traits;
pub mod watch;

pub use kube::KubeControlPlane;
pub use memory::InMemoryCluster;
pub use traits::ControlPlane;
pub use watch::WatchState;

/// Capacity of the node and workload event channels
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
