//! gpuledger-controller: Cluster-driven ledger maintenance
//!
//! This crate keeps the ledger in step with the cluster:
//! - Node registration (credential wait, hardware probe, slot registration)
//! - Edge-triggered workload lifecycle reconciliation
//! - Event loops wiring both to the control plane feeds

pub mod credentials;
pub mod events;
pub mod reconciler;
pub mod registrar;

pub use credentials::CredentialWaiter;
pub use events::{run_node_events, run_node_rescan, run_resync, run_workload_events};
pub use reconciler::{LifecycleReconciler, ReconcileOutcome};
pub use registrar::{NodeRegistrar, NodeState, RegistrationOutcome};
