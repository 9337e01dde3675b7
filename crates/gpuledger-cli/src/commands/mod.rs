//! CLI commands implementation

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Slot capacity from the API
#[derive(Debug, Deserialize)]
pub struct CapacityResponse {
    pub node_id: String,
    pub slot_id: u32,
    pub total_capacity: u64,
    pub used_capacity: u64,
    pub remaining_capacity: u64,
    pub available: bool,
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub store: String,
    pub control_plane: String,
    pub nodes: usize,
    pub slots: usize,
    pub bindings: usize,
    pub total_vram: u64,
    pub used_vram: u64,
}

/// Create a workload
pub async fn create(client: &ApiClient, name: String, image: String, vram: i64) -> Result<()> {
    #[derive(Serialize)]
    struct CreateRequest {
        name: String,
        image: String,
        vram: i64,
    }

    debug!(name = %name, image = %image, vram = vram, "Creating workload");
    let response = client
        .client
        .post(client.url("/create"))
        .json(&CreateRequest { name, image, vram })
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        anyhow::bail!("Failed to create workload ({}): {}", status, body.trim());
    }
    println!("{}", body.trim());

    Ok(())
}

/// Show per-slot capacity
pub async fn capacity(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/capacity"))
        .send()
        .await?;

    if !response.status().is_success() {
        let error = response.text().await?;
        anyhow::bail!("Failed to get capacity: {}", error.trim());
    }

    let records: Vec<CapacityResponse> = response.json().await?;
    if records.is_empty() {
        println!("No GPU slots registered");
        return Ok(());
    }

    println!(
        "{:<24} {:>5} {:>8} {:>8} {:>10} {:>10}",
        "NODE", "SLOT", "TOTAL", "USED", "REMAINING", "AVAILABLE"
    );
    for record in records {
        println!("{}", format_capacity_row(&record));
    }

    Ok(())
}

/// Show ledger status
pub async fn status(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if !response.status().is_success() {
        let error = response.text().await?;
        anyhow::bail!("Failed to get status: {}", error.trim());
    }

    let status: StatusResponse = response.json().await?;
    println!("gpuledger v{}", status.version);
    println!();
    println!("Store: {}", status.store);
    println!("Control plane: {}", status.control_plane);
    println!("Nodes: {}", status.nodes);
    println!("Slots: {}", status.slots);
    println!("Bindings: {}", status.bindings);
    println!(
        "VRAM: {} GiB used of {} GiB",
        status.used_vram, status.total_vram
    );

    Ok(())
}

fn format_capacity_row(record: &CapacityResponse) -> String {
    format!(
        "{:<24} {:>5} {:>8} {:>8} {:>10} {:>10}",
        record.node_id,
        record.slot_id,
        record.total_capacity,
        record.used_capacity,
        record.remaining_capacity,
        if record.available { "yes" } else { "no" }
    )
}
