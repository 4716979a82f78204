// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local persistence of warehouses and shipments.
//!
//! Each node owns its own SQLite database; ids are assigned locally, so the
//! same logical record usually has different ids on different nodes.
//!
//! The store holds domain rows only. A broadcast that fails leaves no trace
//! here: there is no outbox and no retry table.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with capped exponential backoff
//! (up to 5 attempts, 10ms doubling to 500ms). Other errors surface
//! immediately.

use crate::config::StoreConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resources::{
    Pagination, Shipment, ShipmentCreate, ShipmentUpdate, Warehouse, WarehouseCreate,
    WarehouseUpdate, DEFAULT_SHIPMENT_STATUS,
};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const WAREHOUSE_COLUMNS: &str = "id, name, location, created_at";
const SHIPMENT_COLUMNS: &str =
    "id, tracking_number, origin, destination, weight, status, warehouse_id, created_at, updated_at";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map a unique-constraint violation to [`ReplicationError::Conflict`].
fn conflict_or_store(e: sqlx::Error, what: impl FnOnce() -> String) -> ReplicationError {
    match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            ReplicationError::Conflict(what())
        }
        _ => ReplicationError::Store(e),
    }
}

/// SQLite-backed store of the node's domain rows.
pub struct LogisticsStore {
    pool: SqlitePool,
    path: String,
}

impl LogisticsStore {
    /// Open (creating if needed) the store described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let pool = if config.is_in_memory() {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            // One connection that never recycles, or the database disappears
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let mut options =
                SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
                    .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
                    .synchronous(SqliteSynchronous::Normal)
                    .create_if_missing(true);
            if config.wal_mode {
                options = options.journal_mode(SqliteJournalMode::Wal);
            }
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?
        };

        let store = Self {
            pool,
            path: config.sqlite_path.clone(),
        };
        store.migrate().await?;
        info!(path = %store.path, "Logistics store ready");
        Ok(store)
    }

    /// Open a private in-memory store.
    pub async fn in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory()).await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS warehouses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                location TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // warehouse_id is not a foreign key: replicated rows may reference
        // an id that only exists on the origin node
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS shipments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tracking_number TEXT NOT NULL UNIQUE,
                origin TEXT NOT NULL,
                destination TEXT NOT NULL,
                weight REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                warehouse_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Database path (or `":memory:"`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Names of the user tables, sorted.
    pub async fn table_names(&self) -> Result<Vec<String>> {
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names.into_iter().map(|(n,)| n).collect())
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!(path = %self.path, "Logistics store closed");
    }

    // =========================================================================
    // Warehouses
    // =========================================================================

    pub async fn create_warehouse(&self, input: &WarehouseCreate) -> Result<Warehouse> {
        let sql = format!(
            "INSERT INTO warehouses (name, location, created_at) VALUES (?, ?, ?) RETURNING {}",
            WAREHOUSE_COLUMNS
        );
        let now = Utc::now();
        let row = execute_with_retry("create_warehouse", || {
            sqlx::query_as::<_, Warehouse>(&sql)
                .bind(&input.name)
                .bind(&input.location)
                .bind(now)
                .fetch_one(&self.pool)
        })
        .await?;
        Ok(row)
    }

    pub async fn get_warehouse(&self, id: i64) -> Result<Option<Warehouse>> {
        let sql = format!("SELECT {} FROM warehouses WHERE id = ?", WAREHOUSE_COLUMNS);
        let row = sqlx::query_as::<_, Warehouse>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_warehouses(&self, page: Pagination) -> Result<Vec<Warehouse>> {
        let sql = format!(
            "SELECT {} FROM warehouses ORDER BY id LIMIT ? OFFSET ?",
            WAREHOUSE_COLUMNS
        );
        let rows = sqlx::query_as::<_, Warehouse>(&sql)
            .bind(page.limit)
            .bind(page.skip)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Apply the sent fields. Returns `None` if the row does not exist.
    pub async fn update_warehouse(&self, id: i64, update: &WarehouseUpdate) -> Result<Option<Warehouse>> {
        let sql = format!(
            "UPDATE warehouses SET name = COALESCE(?, name), location = COALESCE(?, location) \
             WHERE id = ? RETURNING {}",
            WAREHOUSE_COLUMNS
        );
        let row = execute_with_retry("update_warehouse", || {
            sqlx::query_as::<_, Warehouse>(&sql)
                .bind(update.name.as_deref())
                .bind(update.location.as_deref())
                .bind(id)
                .fetch_optional(&self.pool)
        })
        .await?;
        Ok(row)
    }

    /// Returns whether a row was deleted.
    pub async fn delete_warehouse(&self, id: i64) -> Result<bool> {
        let result = execute_with_retry("delete_warehouse", || {
            sqlx::query("DELETE FROM warehouses WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_warehouses(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM warehouses")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Shipments
    // =========================================================================

    pub async fn create_shipment(&self, input: &ShipmentCreate) -> Result<Shipment> {
        let sql = format!(
            "INSERT INTO shipments \
             (tracking_number, origin, destination, weight, status, warehouse_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING {}",
            SHIPMENT_COLUMNS
        );
        let now = Utc::now();
        execute_with_retry("create_shipment", || {
            sqlx::query_as::<_, Shipment>(&sql)
                .bind(&input.tracking_number)
                .bind(&input.origin)
                .bind(&input.destination)
                .bind(input.weight)
                .bind(DEFAULT_SHIPMENT_STATUS)
                .bind(input.warehouse_id)
                .bind(now)
                .bind(now)
                .fetch_one(&self.pool)
        })
        .await
        .map_err(|e| {
            conflict_or_store(e, || {
                format!("Tracking number {} already exists", input.tracking_number)
            })
        })
    }

    pub async fn get_shipment(&self, id: i64) -> Result<Option<Shipment>> {
        let sql = format!("SELECT {} FROM shipments WHERE id = ?", SHIPMENT_COLUMNS);
        let row = sqlx::query_as::<_, Shipment>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn find_shipment_by_tracking(&self, tracking_number: &str) -> Result<Option<Shipment>> {
        let sql = format!(
            "SELECT {} FROM shipments WHERE tracking_number = ?",
            SHIPMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, Shipment>(&sql)
            .bind(tracking_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_shipments(&self, page: Pagination) -> Result<Vec<Shipment>> {
        let sql = format!(
            "SELECT {} FROM shipments ORDER BY id LIMIT ? OFFSET ?",
            SHIPMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, Shipment>(&sql)
            .bind(page.limit)
            .bind(page.skip)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Apply the sent fields and bump `updated_at`. Returns `None` if the row does not exist.
    pub async fn update_shipment(&self, id: i64, update: &ShipmentUpdate) -> Result<Option<Shipment>> {
        let sql = format!(
            "UPDATE shipments SET \
             origin = COALESCE(?, origin), \
             destination = COALESCE(?, destination), \
             weight = COALESCE(?, weight), \
             status = COALESCE(?, status), \
             warehouse_id = COALESCE(?, warehouse_id), \
             updated_at = ? \
             WHERE id = ? RETURNING {}",
            SHIPMENT_COLUMNS
        );
        let now = Utc::now();
        let row = execute_with_retry("update_shipment", || {
            sqlx::query_as::<_, Shipment>(&sql)
                .bind(update.origin.as_deref())
                .bind(update.destination.as_deref())
                .bind(update.weight)
                .bind(update.status.as_deref())
                .bind(update.warehouse_id)
                .bind(now)
                .bind(id)
                .fetch_optional(&self.pool)
        })
        .await?;
        Ok(row)
    }

    /// Returns whether a row was deleted.
    pub async fn delete_shipment(&self, id: i64) -> Result<bool> {
        let result = execute_with_retry("delete_shipment", || {
            sqlx::query("DELETE FROM shipments WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_shipments(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM shipments")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
