//! gpuledger daemon
//!
//! Runs the admission API, node registrar and lifecycle reconciler against
//! one shared VRAM ledger.

use anyhow::Context;
use clap::Parser;
use gpuledger_api::{create_router, AppState};
use gpuledger_cluster::{ControlPlane, InMemoryCluster, KubeControlPlane};
use gpuledger_controller::{
    run_node_events, run_node_rescan, run_resync, run_workload_events, CredentialWaiter,
    LifecycleReconciler, NodeRegistrar,
};
use gpuledger_core::{ClusterBackend, DaemonConfig, LoggingConfig, StoreBackend};
use gpuledger_probe::{SshProbe, SshProbeConfig};
use gpuledger_scheduler::{AllocationCoordinator, RetryPolicy};
use gpuledger_store::{LedgerStore, MemoryLedger, PostgresLedger};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// gpuledger daemon - fractional GPU memory ledger for cluster workloads
#[derive(Parser, Debug)]
#[command(name = "gpuledgerd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "GPULEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Command line flags win over file and environment
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(address) = &self.address {
            config.api.address = address.clone();
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        DaemonConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);

    init_logging(&config.logging)?;
    info!("Starting gpuledger daemon v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn LedgerStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryLedger::new()),
        StoreBackend::Postgres => Arc::new(
            PostgresLedger::connect(&config.store)
                .await
                .context("Failed to connect to ledger database")?,
        ),
    };

    let selector = config.cluster.workload_selector.clone();
    let kube = match config.cluster.backend {
        ClusterBackend::Kubernetes => Some(Arc::new(
            KubeControlPlane::new(&config.cluster).context("Failed to create cluster client")?,
        )),
        ClusterBackend::Memory => None,
    };
    let plane: Arc<dyn ControlPlane> = match &kube {
        Some(kube) => kube.clone(),
        None => Arc::new(InMemoryCluster::new(config.cluster.namespace.clone())),
    };
    info!(
        store = store.name(),
        control_plane = plane.name(),
        namespace = plane.namespace(),
        "Backends ready"
    );

    // Subscribe before the watcher emits its first poll
    let node_events = plane.watch_nodes();
    let workload_events = plane.watch_workloads();
    let watcher = kube.map(|kube| kube.spawn_watcher(selector.clone()));

    let probe = Arc::new(SshProbe::new(SshProbeConfig::from(&config.probe)));
    let registrar = Arc::new(NodeRegistrar::new(
        store.clone(),
        plane.clone(),
        probe,
        CredentialWaiter::from_config(plane.clone(), &config.registrar),
        config.probe.ssh_user.clone(),
        (
            config.cluster.gpu_node_label.clone(),
            config.cluster.gpu_node_label_value.clone(),
        ),
    ));
    let reconciler = Arc::new(LifecycleReconciler::new(
        store.clone(),
        plane.clone(),
        selector.clone(),
        &config.reconciler,
    ));

    match registrar.bootstrap().await {
        Ok(pending) => info!(pending = pending.len(), "Node bootstrap started"),
        Err(e) => warn!(error = %e, "Node bootstrap failed, waiting for node events"),
    }

    let mut tasks = vec![tokio::spawn(run_node_events(registrar.clone(), node_events))];
    if config.registrar.rescan_interval_secs > 0 {
        tasks.push(tokio::spawn(run_node_rescan(
            registrar,
            Duration::from_secs(config.registrar.rescan_interval_secs),
        )));
    }
    tasks.push(tokio::spawn(run_workload_events(
        reconciler.clone(),
        workload_events,
    )));
    if config.reconciler.resync_interval_secs > 0 {
        tasks.push(tokio::spawn(run_resync(
            reconciler,
            Duration::from_secs(config.reconciler.resync_interval_secs),
        )));
    }
    tasks.extend(watcher);

    let coordinator = Arc::new(AllocationCoordinator::new(
        store.clone(),
        RetryPolicy::from(&config.allocator),
    ));
    let state = AppState::new(coordinator, store, plane, &selector);
    let router = create_router(state, config.api.request_timeout());

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    for task in tasks {
        task.abort();
    }
    info!("gpuledger daemon stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level")?;

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if config.format.eq_ignore_ascii_case("json") {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.context("Failed to set subscriber")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from(["gpuledgerd", "--port", "32000", "--log-level", "debug"]);
        let mut config = DaemonConfig::default();
        args.apply(&mut config);

        assert_eq!(config.api.port, 32000);
        assert_eq!(config.api.address, "0.0.0.0");
        assert_eq!(config.logging.level, "debug");
    }
}
