//! Credential lookup for node probing

use gpuledger_cluster::ControlPlane;
use gpuledger_core::{LedgerError, LedgerResult, RegistrarConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Polls the control plane for a node's credential secret until it appears
pub struct CredentialWaiter {
    plane: Arc<dyn ControlPlane>,
    secret_suffix: String,
    key: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl CredentialWaiter {
    pub fn new(
        plane: Arc<dyn ControlPlane>,
        secret_suffix: impl Into<String>,
        key: impl Into<String>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            plane,
            secret_suffix: secret_suffix.into(),
            key: key.into(),
            poll_interval,
            timeout,
        }
    }

    pub fn from_config(plane: Arc<dyn ControlPlane>, config: &RegistrarConfig) -> Self {
        Self::new(
            plane,
            config.credential_secret_suffix.clone(),
            config.credential_key.clone(),
            Duration::from_secs(config.credential_poll_interval_secs.max(1)),
            Duration::from_secs(config.credential_timeout_secs),
        )
    }

    /// Name of the secret holding `node`'s credential
    pub fn secret_name(&self, node: &str) -> String {
        format!("{}{}", node, self.secret_suffix)
    }

    /// Wait for `node`'s credential, failing with `CredentialTimeout`
    pub async fn wait(&self, node: &str) -> LedgerResult<String> {
        let name = self.secret_name(node);
        let started = Instant::now();
        let deadline = started + self.timeout;

        loop {
            match self.plane.get_secret(&name).await {
                Ok(secret) => match secret.data.get(&self.key) {
                    Some(value) => {
                        debug!(node = node, secret = %name, "Credential found");
                        return Ok(value.clone());
                    }
                    None => debug!(secret = %name, key = %self.key, "Credential key missing, waiting"),
                },
                Err(LedgerError::NotFound(_)) => {
                    debug!(secret = %name, "Credential not found, waiting")
                }
                Err(e) => warn!(secret = %name, error = %e, "Credential lookup failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LedgerError::CredentialTimeout {
                    secret: name,
                    waited_secs: now.duration_since(started).as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
