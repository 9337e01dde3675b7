//! gpuledger CLI
//!
//! Command-line interface for the gpuledger daemon.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// gpuledger - fractional GPU memory ledger for cluster workloads
#[derive(Parser, Debug)]
#[command(name = "gpuledger")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:31000", env = "GPULEDGER_API", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a workload bound to a GPU slot
    Create {
        /// Workload name
        name: String,

        /// Container image
        image: String,

        /// VRAM to reserve, in GiB
        #[arg(long)]
        vram: i64,
    },

    /// Show per-slot VRAM capacity
    Capacity,

    /// Show ledger status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Create { name, image, vram } => {
            commands::create(&client, name, image, vram).await?;
        }
        Commands::Capacity => {
            commands::capacity(&client).await?;
        }
        Commands::Status => {
            commands::status(&client).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create() {
        let cli = Cli::parse_from(["gpuledger", "create", "train-1", "busybox", "--vram", "6"]);
        match cli.command {
            Commands::Create { name, image, vram } => {
                assert_eq!(name, "train-1");
                assert_eq!(image, "busybox");
                assert_eq!(vram, 6);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_create_requires_vram() {
        assert!(Cli::try_parse_from(["gpuledger", "create", "train-1", "busybox"]).is_err());
    }
}
