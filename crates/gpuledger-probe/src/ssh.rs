//! SSH-based hardware probe
//!
//! Runs `nvidia-smi` on the target node through `sshpass` + `ssh`. The
//! password is handed to `sshpass` through its environment, never on the
//! command line.

use async_trait::async_trait;
use gpuledger_core::{LedgerError, LedgerResult, ProbeConfig};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::parse::{mib_to_units, parse_gpu_indices, parse_memory_total_mib};
use crate::traits::{HardwareProbe, ProbeCredentials, SlotCapacity};

const INVENTORY_QUERY: &str = "nvidia-smi --query-gpu=index --format=csv,noheader";

/// ssh exits with 255 when the connection itself failed
const SSH_CONNECTION_FAILURE: i32 = 255;

/// SSH probe configuration
#[derive(Debug, Clone)]
pub struct SshProbeConfig {
    /// Path to the sshpass binary
    pub sshpass_path: PathBuf,
    /// Path to the ssh binary
    pub ssh_path: PathBuf,
    /// Timeout for each remote command
    pub command_timeout: Duration,
    /// Attempts per remote command
    pub max_attempts: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
}

impl Default for SshProbeConfig {
    fn default() -> Self {
        Self {
            sshpass_path: PathBuf::from("sshpass"),
            ssh_path: PathBuf::from("ssh"),
            command_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl From<&ProbeConfig> for SshProbeConfig {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            command_timeout: Duration::from_secs(config.timeout_secs),
            max_attempts: config.max_attempts.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            ..Self::default()
        }
    }
}

/// Hardware probe running `nvidia-smi` over SSH
pub struct SshProbe {
    config: SshProbeConfig,
}

impl SshProbe {
    /// Create a new SSH probe
    pub fn new(config: SshProbeConfig) -> Self {
        Self { config }
    }

    /// Build the command running `remote` on the node
    fn build_command(
        &self,
        address: &str,
        credentials: &ProbeCredentials,
        remote: &str,
    ) -> Command {
        let mut cmd = Command::new(&self.config.sshpass_path);
        cmd.arg("-e");
        cmd.env("SSHPASS", &credentials.password);

        cmd.arg(&self.config.ssh_path);
        cmd.args(["-o", "StrictHostKeyChecking=no"]);
        cmd.args(["-o", "BatchMode=no"]);
        cmd.arg("-o").arg(format!(
            "ConnectTimeout={}",
            self.config.command_timeout.as_secs().max(1)
        ));
        cmd.arg(format!("{}@{}", credentials.user, address));
        cmd.arg(remote);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        cmd
    }

    /// Run one remote command with a bounded number of attempts
    async fn run(
        &self,
        address: &str,
        credentials: &ProbeCredentials,
        remote: &str,
    ) -> LedgerResult<String> {
        let mut attempt = 1;
        loop {
            match self.run_once(address, credentials, remote).await {
                Ok(stdout) => return Ok(stdout),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    warn!(
                        address = address,
                        attempt = attempt,
                        error = %e,
                        "Probe command failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_once(
        &self,
        address: &str,
        credentials: &ProbeCredentials,
        remote: &str,
    ) -> LedgerResult<String> {
        let mut cmd = self.build_command(address, credentials, remote);
        debug!(address = address, command = remote, "Running probe command");

        let output = match tokio::time::timeout(self.config.command_timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| {
                LedgerError::ProbeUnreachable(format!(
                    "{}: failed to run {}: {}",
                    address,
                    self.config.sshpass_path.display(),
                    e
                ))
            })?,
            Err(_) => {
                return Err(LedgerError::ProbeTimeout {
                    address: address.to_string(),
                    secs: self.config.command_timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = match output.status.code() {
                Some(SSH_CONNECTION_FAILURE) => {
                    format!("{}: ssh connection failed: {}", address, stderr.trim())
                }
                Some(code) => format!("{}: `{}` exited with {}: {}", address, remote, code, stderr.trim()),
                None => format!("{}: `{}` terminated by signal", address, remote),
            };
            return Err(LedgerError::ProbeUnreachable(message));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| LedgerError::ProbeParseError(format!("{}: non UTF-8 output", address)))
    }
}

impl Default for SshProbe {
    fn default() -> Self {
        Self::new(SshProbeConfig::default())
    }
}

#[async_trait]
impl HardwareProbe for SshProbe {
    async fn probe(
        &self,
        address: &str,
        credentials: &ProbeCredentials,
    ) -> LedgerResult<Vec<SlotCapacity>> {
        let inventory = self.run(address, credentials, INVENTORY_QUERY).await?;
        let indices = parse_gpu_indices(&inventory)?;

        let mut slots = Vec::with_capacity(indices.len());
        for index in indices {
            let query = format!(
                "nvidia-smi -i {} --query-gpu=memory.total --format=csv",
                index
            );
            let output = self.run(address, credentials, &query).await?;
            let mib = parse_memory_total_mib(&output)?;
            slots.push(SlotCapacity {
                slot_id: index,
                total_capacity: mib_to_units(mib)?,
            });
        }

        info!(
            address = address,
            slots = slots.len(),
            "Probed GPU inventory"
        );
        Ok(slots)
    }

    fn name(&self) -> &'static str {
        "ssh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_probe_config() {
        let probe_config = ProbeConfig {
            ssh_user: "root".to_string(),
            timeout_secs: 7,
            max_attempts: 0,
            retry_delay_secs: 2,
        };
        let config = SshProbeConfig::from(&probe_config);
        assert_eq!(config.command_timeout, Duration::from_secs(7));
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert_eq!(config.ssh_path, PathBuf::from("ssh"));
    }

    #[test]
    fn test_build_command() {
        let probe = SshProbe::default();
        let creds = ProbeCredentials::new("root", "secret");
        let cmd = probe.build_command("10.0.0.5", &creds, INVENTORY_QUERY);

        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "sshpass");
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "-e");
        assert!(args.contains(&"root@10.0.0.5".to_string()));
        assert_eq!(args.last().map(String::as_str), Some(INVENTORY_QUERY));
        assert!(!args.iter().any(|a| a.contains("secret")));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unreachable() {
        let probe = SshProbe::new(SshProbeConfig {
            sshpass_path: PathBuf::from("/nonexistent/sshpass"),
            max_attempts: 2,
            retry_delay: Duration::from_millis(5),
            ..SshProbeConfig::default()
        });
        let creds = ProbeCredentials::new("root", "secret");

        let err = probe.probe("10.0.0.5", &creds).await.unwrap_err();
        match err {
            LedgerError::ProbeUnreachable(message) => {
                assert!(message.contains("/nonexistent/sshpass"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
