// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The destination seam: where applied changes land.
//!
//! The worker pool hands a [`TableBatch`] — all operations for one table in
//! log order — to a [`Destination`], which applies it in a single
//! transaction. [`MySqlDestination`] is the real backend;
//! [`MemoryDestination`] is an in-process stand-in used by tests and by the
//! end-to-end scenarios in `tests/`.
//!
//! # Idempotence
//!
//! Every operation is replay-safe (see [`crate::dml`]): applying the same
//! batch twice leaves the destination in the same state. The applier relies
//! on this for crash recovery between a payload commit and the position
//! advance.

use crate::dml;
use crate::error::{Result, SyncError};
use crate::event::{BinlogPosition, RowImage};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row, TypeInfo};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Deadline for one destination transaction.
pub const TX_DEADLINE: Duration = Duration::from_secs(30);

/// One row-level operation within a batch, in log order.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    /// Insert-or-replace the full image (idempotent INSERT).
    Upsert { image: RowImage },
    /// Update by primary key; falls back to an upsert of `image` when no
    /// row matches `where_pk`.
    Update {
        image: RowImage,
        where_pk: serde_json::Value,
    },
    /// Delete by primary key; absence is not an error.
    Delete { pk: serde_json::Value },
}

/// All operations for one table from one worker flush, in log order.
#[derive(Debug, Clone)]
pub struct TableBatch {
    pub table: String,
    pub pk_column: String,
    pub ops: Vec<RowOp>,
    /// Highest binlog position contributing to this batch.
    pub max_position: BinlogPosition,
    /// Source timestamp of the last contributing event.
    pub last_source_timestamp: u32,
}

impl TableBatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Where applied changes land. One transaction per [`TableBatch`].
#[async_trait]
pub trait Destination: Send + Sync + 'static {
    /// Apply the batch transactionally. Returns the number of row
    /// operations applied. On error the transaction is rolled back and
    /// nothing is visible.
    async fn apply(&self, batch: &TableBatch) -> Result<u64>;

    /// Fetch the current image of a row by primary key.
    async fn fetch_row(
        &self,
        table: &str,
        pk_column: &str,
        pk: &serde_json::Value,
    ) -> Result<Option<RowImage>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// MySQL destination
// ═══════════════════════════════════════════════════════════════════════════

/// Real destination backed by a MySQL connection pool.
pub struct MySqlDestination {
    pool: MySqlPool,
}

impl MySqlDestination {
    /// Connect a pool sized for `workers` appliers
    /// (max open 2×workers, min idle workers, 1h connection lifetime).
    pub async fn connect(url: &str, workers: usize) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections((workers * 2).max(2) as u32)
            .min_connections(workers as u32)
            .max_lifetime(Duration::from_secs(3600))
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| SyncError::destination("(pool)", e))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn apply_inner(&self, batch: &TableBatch) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::destination(&batch.table, e))?;

        let mut applied = 0u64;
        for op in &batch.ops {
            match op {
                RowOp::Upsert { image } => {
                    let stmt = dml::upsert(&batch.table, &batch.pk_column, image)?;
                    execute(&mut tx, &batch.table, &stmt).await?;
                }
                RowOp::Update { image, where_pk } => {
                    let stmt = dml::update(&batch.table, &batch.pk_column, image, where_pk)?;
                    let affected = execute(&mut tx, &batch.table, &stmt).await?;
                    if affected == 0 {
                        // No row matched: insert the after-image instead.
                        let stmt = dml::upsert(&batch.table, &batch.pk_column, image)?;
                        execute(&mut tx, &batch.table, &stmt).await?;
                    }
                }
                RowOp::Delete { pk } => {
                    let stmt = dml::delete(&batch.table, &batch.pk_column, pk);
                    execute(&mut tx, &batch.table, &stmt).await?;
                }
            }
            applied += 1;
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::destination(&batch.table, e))?;
        trace!(table = %batch.table, applied, "Batch committed");
        Ok(applied)
    }
}

#[async_trait]
impl Destination for MySqlDestination {
    async fn apply(&self, batch: &TableBatch) -> Result<u64> {
        match tokio::time::timeout(TX_DEADLINE, self.apply_inner(batch)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                operation: format!("destination_tx({})", batch.table),
                seconds: TX_DEADLINE.as_secs(),
            }),
        }
    }

    async fn fetch_row(
        &self,
        table: &str,
        pk_column: &str,
        pk: &serde_json::Value,
    ) -> Result<Option<RowImage>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ? LIMIT 1",
            dml::quote_ident(table),
            dml::quote_ident(pk_column)
        );
        let row = bind_value(sqlx::query(&sql), pk)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::destination(table, e))?;
        Ok(row.as_ref().map(mysql_row_to_image))
    }
}

/// Bind one JSON value as a statement parameter.
fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    value: &'q serde_json::Value,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    match value {
        serde_json::Value::Null => query.bind(Option::<String>::None),
        serde_json::Value::Bool(b) => query.bind(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => query.bind(s.as_str()),
        // Arrays/objects land in JSON columns as their serialized text.
        other => query.bind(other.to_string()),
    }
}

async fn execute(
    tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
    table: &str,
    stmt: &dml::DmlStatement,
) -> Result<u64> {
    let mut query = sqlx::query(&stmt.sql);
    for param in &stmt.params {
        query = bind_value(query, param);
    }
    let result = query
        .execute(&mut **tx)
        .await
        .map_err(|e| SyncError::destination(table, e))?;
    Ok(result.rows_affected())
}

/// Convert a fetched row to a column → JSON value image.
fn mysql_row_to_image(row: &MySqlRow) -> RowImage {
    let mut image = RowImage::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().name();
        let value = match type_name {
            "BOOLEAN" => row
                .try_get::<Option<bool>, _>(i)
                .ok()
                .flatten()
                .map(serde_json::Value::Bool),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => row
                .try_get::<Option<i64>, _>(i)
                .ok()
                .flatten()
                .map(|v| serde_json::Value::from(v)),
            "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
            | "BIGINT UNSIGNED" => row
                .try_get::<Option<u64>, _>(i)
                .ok()
                .flatten()
                .map(serde_json::Value::from),
            "FLOAT" | "DOUBLE" => row
                .try_get::<Option<f64>, _>(i)
                .ok()
                .flatten()
                .map(serde_json::Value::from),
            "DATETIME" | "TIMESTAMP" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
                .ok()
                .flatten()
                .map(|dt| serde_json::Value::String(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
            _ => row
                .try_get::<Option<String>, _>(i)
                .ok()
                .flatten()
                .map(serde_json::Value::String)
                .or_else(|| {
                    row.try_get::<Option<Vec<u8>>, _>(i)
                        .ok()
                        .flatten()
                        .map(|bytes| {
                            serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
                        })
                }),
        };
        image.insert(name, value.unwrap_or(serde_json::Value::Null));
    }
    image
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory destination (tests, standalone mode)
// ═══════════════════════════════════════════════════════════════════════════

/// In-memory destination applying batches to plain maps.
///
/// Semantics mirror [`MySqlDestination`] exactly: upserts replace, updates
/// fall back to inserts, deletes tolerate absence, and a failed batch
/// leaves no partial effect. A gate semaphore lets tests pause appliers to
/// exercise backpressure, and an injectable failure count exercises the
/// retry path.
pub struct MemoryDestination {
    tables: std::sync::Mutex<HashMap<String, BTreeMap<String, RowImage>>>,
    applied_batches: std::sync::atomic::AtomicU64,
    fail_times: std::sync::atomic::AtomicU64,
    gate: Option<Arc<tokio::sync::Semaphore>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self {
            tables: std::sync::Mutex::new(HashMap::new()),
            applied_batches: std::sync::atomic::AtomicU64::new(0),
            fail_times: std::sync::atomic::AtomicU64::new(0),
            gate: None,
        }
    }

    /// A destination whose `apply` waits on `gate` before touching state.
    pub fn with_gate(gate: Arc<tokio::sync::Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    /// Make the next `n` apply calls fail with a retryable error.
    pub fn fail_next(&self, n: u64) {
        self.fail_times
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of successfully applied batches.
    pub fn batches_applied(&self) -> u64 {
        self.applied_batches
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Seed a row directly (test setup).
    pub fn seed(&self, table: &str, pk: &str, image: RowImage) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .entry(table.to_string())
            .or_default()
            .insert(pk.to_string(), image);
    }

    /// Read a row directly (test assertions).
    pub fn get(&self, table: &str, pk: &str) -> Option<RowImage> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table).and_then(|t| t.get(pk)).cloned()
    }

    /// Number of rows currently in a table.
    pub fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table).map(|t| t.len()).unwrap_or(0)
    }

    fn key_of(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn apply(&self, batch: &TableBatch) -> Result<u64> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| SyncError::Internal("gate closed".to_string()))?;
            drop(permit);
        }

        let remaining = self.fail_times.load(std::sync::atomic::Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times
                .store(remaining - 1, std::sync::atomic::Ordering::SeqCst);
            return Err(SyncError::destination(&batch.table, sqlx::Error::PoolTimedOut));
        }

        // Build the new table state first so a batch is all-or-nothing.
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let mut staged = tables.get(&batch.table).cloned().unwrap_or_default();

        let mut applied = 0u64;
        for op in &batch.ops {
            match op {
                RowOp::Upsert { image } => {
                    let pk = image
                        .get(&batch.pk_column)
                        .map(Self::key_of)
                        .ok_or_else(|| {
                            SyncError::schema_mismatch(&batch.table, "image missing primary key")
                        })?;
                    staged.insert(pk, image.clone());
                }
                RowOp::Update { image, where_pk } => {
                    let old_key = Self::key_of(where_pk);
                    let new_key = image
                        .get(&batch.pk_column)
                        .map(Self::key_of)
                        .unwrap_or_else(|| old_key.clone());
                    staged.remove(&old_key);
                    staged.insert(new_key, image.clone());
                }
                RowOp::Delete { pk } => {
                    staged.remove(&Self::key_of(pk));
                }
            }
            applied += 1;
        }

        tables.insert(batch.table.clone(), staged);
        self.applied_batches
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        debug!(table = %batch.table, applied, "Memory batch applied");
        Ok(applied)
    }

    async fn fetch_row(
        &self,
        table: &str,
        _pk_column: &str,
        pk: &serde_json::Value,
    ) -> Result<Option<RowImage>> {
        Ok(self.get(table, &Self::key_of(pk)))
    }
}
