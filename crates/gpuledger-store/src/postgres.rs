//! PostgreSQL ledger store
//!
//! Reservations and releases are conditional `UPDATE ... RETURNING`
//! statements, so the capacity check and the write happen in one statement.
//! Binding operations run in a transaction together with the capacity update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpuledger_core::{
    Binding, BindingRecord, CapacityRecord, LedgerError, LedgerResult, StoreConfig, WorkloadId,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

use crate::traits::LedgerStore;

const CREATE_CAPACITY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS gpu_capacity (
    node_id        TEXT    NOT NULL,
    slot_id        BIGINT  NOT NULL,
    total_capacity BIGINT  NOT NULL CHECK (total_capacity >= 0),
    used_capacity  BIGINT  NOT NULL DEFAULT 0
        CHECK (used_capacity >= 0 AND used_capacity <= total_capacity),
    available      BOOLEAN NOT NULL,
    PRIMARY KEY (node_id, slot_id)
)"#;

const CREATE_BINDINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS gpu_bindings (
    namespace TEXT        NOT NULL,
    name      TEXT        NOT NULL,
    node_id   TEXT        NOT NULL,
    slot_id   BIGINT      NOT NULL,
    amount    BIGINT      NOT NULL CHECK (amount >= 0),
    uid       TEXT        NOT NULL,
    bound_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (namespace, name),
    FOREIGN KEY (node_id, slot_id) REFERENCES gpu_capacity (node_id, slot_id)
)"#;

const CREATE_NODES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS gpu_nodes (
    node_id       TEXT        PRIMARY KEY,
    registered_at TIMESTAMPTZ NOT NULL DEFAULT now()
)"#;

const SELECT_CAPACITY: &str = "SELECT node_id, slot_id, total_capacity, used_capacity, available \
     FROM gpu_capacity ORDER BY node_id, slot_id";

const INSERT_SLOT: &str = "INSERT INTO gpu_capacity (node_id, slot_id, total_capacity, used_capacity, available) \
     VALUES ($1, $2, $3, 0, $3 > 0) ON CONFLICT (node_id, slot_id) DO NOTHING";

const RESERVE: &str = "UPDATE gpu_capacity \
     SET used_capacity = used_capacity + $3, available = used_capacity + $3 < total_capacity \
     WHERE node_id = $1 AND slot_id = $2 AND total_capacity - used_capacity >= $3 \
     RETURNING node_id, slot_id, total_capacity, used_capacity, available";

const RELEASE: &str = "UPDATE gpu_capacity \
     SET used_capacity = used_capacity - $3, available = used_capacity - $3 < total_capacity \
     WHERE node_id = $1 AND slot_id = $2 AND used_capacity >= $3 \
     RETURNING node_id, slot_id, total_capacity, used_capacity, available";

const SELECT_USAGE: &str =
    "SELECT total_capacity, used_capacity FROM gpu_capacity WHERE node_id = $1 AND slot_id = $2";

const INSERT_BINDING: &str = "INSERT INTO gpu_bindings (namespace, name, node_id, slot_id, amount, uid, bound_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (namespace, name) DO NOTHING";

const SELECT_BINDING: &str = "SELECT namespace, name, node_id, slot_id, amount, uid, bound_at \
     FROM gpu_bindings WHERE namespace = $1 AND name = $2";

const SELECT_BINDINGS: &str = "SELECT namespace, name, node_id, slot_id, amount, uid, bound_at \
     FROM gpu_bindings ORDER BY namespace, name";

const DELETE_BINDING: &str = "DELETE FROM gpu_bindings \
     WHERE namespace = $1 AND name = $2 AND ($3::TEXT IS NULL OR uid = $3) \
     RETURNING namespace, name, node_id, slot_id, amount, uid, bound_at";

const INSERT_NODE: &str =
    "INSERT INTO gpu_nodes (node_id) VALUES ($1) ON CONFLICT (node_id) DO NOTHING";

const SELECT_NODES: &str = "SELECT node_id FROM gpu_nodes ORDER BY node_id";

type CapacityRow = (String, i64, i64, i64, bool);
type BindingRow = (String, String, String, i64, i64, String, DateTime<Utc>);

/// Ledger store persisted in PostgreSQL
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Connect to the database and create the ledger tables if missing
    pub async fn connect(config: &StoreConfig) -> LedgerResult<Self> {
        info!(
            max_connections = config.max_connections,
            "Connecting to ledger database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.database_url)
            .await
            .map_err(store_err)?;

        let ledger = Self { pool };
        ledger.init_schema().await?;

        info!("Ledger database ready");
        Ok(ledger)
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the ledger tables if they do not exist
    pub async fn init_schema(&self) -> LedgerResult<()> {
        for statement in [CREATE_CAPACITY_TABLE, CREATE_BINDINGS_TABLE, CREATE_NODES_TABLE] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedger {
    async fn list_capacity(&self) -> LedgerResult<Vec<CapacityRecord>> {
        let rows: Vec<CapacityRow> = sqlx::query_as(SELECT_CAPACITY)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(capacity_from_row).collect()
    }

    async fn register_slot(
        &self,
        node_id: &str,
        slot_id: u32,
        total_capacity: u64,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(INSERT_SLOT)
            .bind(node_id)
            .bind(i64::from(slot_id))
            .bind(to_db(total_capacity)?)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            info!(
                node_id = node_id,
                slot_id = slot_id,
                total_capacity = total_capacity,
                "Registered GPU slot"
            );
        }
        Ok(inserted)
    }

    async fn reserve(
        &self,
        node_id: &str,
        slot_id: u32,
        amount: u64,
    ) -> LedgerResult<CapacityRecord> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        reserve_on(&mut conn, node_id, slot_id, amount).await
    }

    async fn release(
        &self,
        node_id: &str,
        slot_id: u32,
        amount: u64,
    ) -> LedgerResult<CapacityRecord> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        release_on(&mut conn, node_id, slot_id, amount).await
    }

    async fn reserve_for(
        &self,
        workload: &WorkloadId,
        binding: &Binding,
    ) -> LedgerResult<BindingRecord> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        reserve_on(&mut tx, &binding.node_id, binding.slot_id, binding.amount).await?;

        let record = BindingRecord::new(workload.clone(), binding.clone());
        let inserted = sqlx::query(INSERT_BINDING)
            .bind(&workload.namespace)
            .bind(&workload.name)
            .bind(&binding.node_id)
            .bind(i64::from(binding.slot_id))
            .bind(to_db(binding.amount)?)
            .bind(&record.uid)
            .bind(record.bound_at)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?
            .rows_affected();

        if inserted == 0 {
            // Dropping the transaction rolls back the reservation.
            return Err(LedgerError::AlreadyExists(format!(
                "binding for workload {}",
                workload
            )));
        }

        tx.commit().await.map_err(store_err)?;
        Ok(record)
    }

    async fn binding(&self, workload: &WorkloadId) -> LedgerResult<Option<BindingRecord>> {
        let row: Option<BindingRow> = sqlx::query_as(SELECT_BINDING)
            .bind(&workload.namespace)
            .bind(&workload.name)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(binding_from_row).transpose()
    }

    async fn list_bindings(&self) -> LedgerResult<Vec<BindingRecord>> {
        let rows: Vec<BindingRow> = sqlx::query_as(SELECT_BINDINGS)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(binding_from_row).collect()
    }

    async fn reclaim(
        &self,
        workload: &WorkloadId,
        uid: Option<&str>,
    ) -> LedgerResult<Option<BindingRecord>> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let row: Option<BindingRow> = sqlx::query_as(DELETE_BINDING)
            .bind(&workload.namespace)
            .bind(&workload.name)
            .bind(uid)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = binding_from_row(row)?;
        let binding = &record.binding;

        release_on(&mut tx, &binding.node_id, binding.slot_id, binding.amount).await?;
        tx.commit().await.map_err(store_err)?;

        debug!(workload = %workload, binding = %binding, "Reclaimed binding");
        Ok(Some(record))
    }

    async fn mark_node_registered(&self, node_id: &str) -> LedgerResult<()> {
        sqlx::query(INSERT_NODE)
            .bind(node_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn registered_nodes(&self) -> LedgerResult<BTreeSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(SELECT_NODES)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(|(node_id,)| node_id).collect())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

async fn reserve_on(
    conn: &mut PgConnection,
    node_id: &str,
    slot_id: u32,
    amount: u64,
) -> LedgerResult<CapacityRecord> {
    let row: Option<CapacityRow> = sqlx::query_as(RESERVE)
        .bind(node_id)
        .bind(i64::from(slot_id))
        .bind(to_db(amount)?)
        .fetch_optional(&mut *conn)
        .await
        .map_err(store_err)?;

    match row {
        Some(row) => capacity_from_row(row),
        None => {
            let (total, used) = usage_on(conn, node_id, slot_id).await?;
            Err(LedgerError::InsufficientCapacity {
                node_id: node_id.to_string(),
                slot_id,
                requested: amount,
                remaining: total.saturating_sub(used),
            })
        }
    }
}

async fn release_on(
    conn: &mut PgConnection,
    node_id: &str,
    slot_id: u32,
    amount: u64,
) -> LedgerResult<CapacityRecord> {
    let row: Option<CapacityRow> = sqlx::query_as(RELEASE)
        .bind(node_id)
        .bind(i64::from(slot_id))
        .bind(to_db(amount)?)
        .fetch_optional(&mut *conn)
        .await
        .map_err(store_err)?;

    match row {
        Some(row) => capacity_from_row(row),
        None => {
            let (_, used) = usage_on(conn, node_id, slot_id).await?;
            Err(LedgerError::OverRelease {
                node_id: node_id.to_string(),
                slot_id,
                requested: amount,
                used,
            })
        }
    }
}

/// Read (total, used) for error reporting after a conditional update matched nothing
async fn usage_on(conn: &mut PgConnection, node_id: &str, slot_id: u32) -> LedgerResult<(u64, u64)> {
    let row: Option<(i64, i64)> = sqlx::query_as(SELECT_USAGE)
        .bind(node_id)
        .bind(i64::from(slot_id))
        .fetch_optional(&mut *conn)
        .await
        .map_err(store_err)?;

    match row {
        Some((total, used)) => Ok((from_db(total)?, from_db(used)?)),
        None => Err(LedgerError::NotFound(format!(
            "capacity record {}/{}",
            node_id, slot_id
        ))),
    }
}

fn store_err(err: sqlx::Error) -> LedgerError {
    LedgerError::StoreUnavailable(err.to_string())
}

fn to_db(value: u64) -> LedgerResult<i64> {
    i64::try_from(value)
        .map_err(|_| LedgerError::InvalidRequest(format!("VRAM amount {} out of range", value)))
}

fn from_db(value: i64) -> LedgerResult<u64> {
    u64::try_from(value)
        .map_err(|_| LedgerError::Internal(format!("negative VRAM value {} in ledger", value)))
}

fn slot_from_db(value: i64) -> LedgerResult<u32> {
    u32::try_from(value)
        .map_err(|_| LedgerError::Internal(format!("slot id {} out of range", value)))
}

fn capacity_from_row(row: CapacityRow) -> LedgerResult<CapacityRecord> {
    let (node_id, slot_id, total_capacity, used_capacity, available) = row;
    Ok(CapacityRecord {
        node_id,
        slot_id: slot_from_db(slot_id)?,
        total_capacity: from_db(total_capacity)?,
        used_capacity: from_db(used_capacity)?,
        available,
    })
}

fn binding_from_row(row: BindingRow) -> LedgerResult<BindingRecord> {
    let (namespace, name, node_id, slot_id, amount, uid, bound_at) = row;
    Ok(BindingRecord {
        workload: WorkloadId::new(namespace, name),
        binding: Binding::new(node_id, slot_from_db(slot_id)?, from_db(amount)?),
        uid,
        bound_at,
    })
}
