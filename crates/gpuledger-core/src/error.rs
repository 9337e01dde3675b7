//! Error types for gpuledger

use thiserror::Error;

/// Main error type for gpuledger
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Request failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Capacity record, workload or secret not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object with the same identity already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A single slot cannot satisfy a reservation
    #[error(
        "Insufficient capacity on {node_id}/{slot_id}: requested {requested}, remaining {remaining}"
    )]
    InsufficientCapacity {
        node_id: String,
        slot_id: u32,
        requested: u64,
        remaining: u64,
    },

    /// No slot in the ledger can satisfy an allocation
    #[error("No capacity available for {requested} VRAM units")]
    NoCapacityAvailable { requested: u64 },

    /// Release of more VRAM than is in use on a slot
    #[error("Over-release on {node_id}/{slot_id}: releasing {requested}, in use {used}")]
    OverRelease {
        node_id: String,
        slot_id: u32,
        requested: u64,
        used: u64,
    },

    /// Hardware probe could not reach the node
    #[error("Probe unreachable: {0}")]
    ProbeUnreachable(String),

    /// Hardware probe did not answer in time
    #[error("Probe of {address} timed out after {secs}s")]
    ProbeTimeout { address: String, secs: u64 },

    /// Hardware probe output did not match the expected format
    #[error("Probe output parse error: {0}")]
    ProbeParseError(String),

    /// Node credential did not appear in time
    #[error("Timed out after {waited_secs}s waiting for credential secret {secret}")]
    CredentialTimeout { secret: String, waited_secs: u64 },

    /// Terminal workload whose binding cannot be recovered
    #[error("Unreconciled workload: {0}")]
    UnreconciledWorkload(String),

    /// Ledger store backend is unavailable
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Cluster control plane request failed
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpuledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    /// Whether a bounded retry may absorb this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientCapacity { .. }
                | LedgerError::ProbeUnreachable(_)
                | LedgerError::ProbeTimeout { .. }
                | LedgerError::StoreUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        LedgerError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LedgerError::InsufficientCapacity {
            node_id: "node-a".to_string(),
            slot_id: 1,
            requested: 8,
            remaining: 4,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient capacity on node-a/1: requested 8, remaining 4"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: LedgerError = io_err.into();
        assert!(matches!(err, LedgerError::Io(_)));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(LedgerError::StoreUnavailable("down".to_string()).is_retryable());
        assert!(!LedgerError::NoCapacityAvailable { requested: 1 }.is_retryable());
        assert!(!LedgerError::InvalidRequest("zero".to_string()).is_retryable());
    }
}
