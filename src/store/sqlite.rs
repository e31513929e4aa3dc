// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed state store.
//!
//! The default backend: positions, conflicts, and run history live in a
//! local file next to the service. WAL mode keeps position upserts cheap;
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff because
//! the external HTTP layer reads the same file.

use super::{
    image_from_json, image_to_json, tables_from_json, tables_to_json, ConflictRecord, RunRecord,
    RunStatus, StateStore, TablePosition, TableStatus,
};
use crate::config::{ConflictResolution, SyncDirection};
use crate::conflict::ConflictKind;
use crate::error::{Result, SyncError};
use crate::event::RowImage;
use crate::metrics;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const BUSY_RETRY_MAX_ATTEMPTS: u32 = 5;
const BUSY_RETRY_BASE_DELAY_MS: u64 = 10;
const BUSY_RETRY_MAX_DELAY_MS: u64 = 500;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_state (
    table_name            TEXT NOT NULL,
    direction             TEXT NOT NULL,
    last_file             TEXT NOT NULL,
    last_offset           INTEGER NOT NULL,
    last_source_timestamp INTEGER NOT NULL DEFAULT 0,
    rows_applied          INTEGER NOT NULL DEFAULT 0,
    status                TEXT NOT NULL,
    error_message         TEXT,
    updated_at            TEXT NOT NULL,
    PRIMARY KEY (table_name, direction)
);

CREATE TABLE IF NOT EXISTS conflicts (
    id                  TEXT PRIMARY KEY,
    table_name          TEXT NOT NULL,
    primary_key_value   TEXT NOT NULL,
    local_image         TEXT NOT NULL,
    cloud_image         TEXT NOT NULL,
    conflict_type       TEXT NOT NULL,
    detected_at         TEXT NOT NULL,
    resolved            INTEGER NOT NULL DEFAULT 0,
    resolution_strategy TEXT,
    resolved_at         TEXT,
    resolved_image      TEXT
);

CREATE INDEX IF NOT EXISTS idx_conflicts_resolved ON conflicts(resolved);
CREATE INDEX IF NOT EXISTS idx_conflicts_table ON conflicts(table_name);
CREATE UNIQUE INDEX IF NOT EXISTS idx_conflicts_open
    ON conflicts(table_name, primary_key_value) WHERE resolved = 0;

CREATE TABLE IF NOT EXISTS sync_history (
    id                 TEXT PRIMARY KEY,
    started_at         TEXT NOT NULL,
    completed_at       TEXT,
    direction          TEXT NOT NULL,
    tables_synced      TEXT NOT NULL,
    total_rows_applied INTEGER NOT NULL DEFAULT 0,
    conflicts_detected INTEGER NOT NULL DEFAULT 0,
    status             TEXT NOT NULL,
    error_message      TEXT
);

CREATE INDEX IF NOT EXISTS idx_history_started ON sync_history(started_at);
"#;

/// Check if an error is a retryable SQLite busy/locked error.
fn is_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED.
async fn with_busy_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = BUSY_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_busy_error(&e) && attempts < BUSY_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(BUSY_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// State store backed by a local SQLite file.
pub struct SqliteStateStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteStateStore {
    /// Open (and create if missing) the state database at `path`.
    ///
    /// `":memory:"` opens a private in-memory database (tests).
    pub async fn open(path: &str) -> Result<Self> {
        info!(path = %path, "Opening sqlite state store");

        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| SyncError::Config(format!("invalid sqlite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        // A memory database is per-connection; the pool must not grow past 1.
        let max_connections = if path == ":memory:" { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(SyncError::StateStore)?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(SyncError::StateStore)?;

        Ok(Self {
            pool,
            path: path.to_string(),
        })
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    fn row_to_position(row: &SqliteRow) -> Result<TablePosition> {
        let direction: String = row.try_get("direction").map_err(SyncError::StateStore)?;
        let status: String = row.try_get("status").map_err(SyncError::StateStore)?;
        Ok(TablePosition {
            table_name: row.try_get("table_name").map_err(SyncError::StateStore)?,
            last_file: row.try_get("last_file").map_err(SyncError::StateStore)?,
            last_offset: row
                .try_get::<i64, _>("last_offset")
                .map_err(SyncError::StateStore)? as u64,
            last_source_timestamp: row
                .try_get("last_source_timestamp")
                .map_err(SyncError::StateStore)?,
            rows_applied: row
                .try_get::<i64, _>("rows_applied")
                .map_err(SyncError::StateStore)? as u64,
            direction: serde_json::from_value(serde_json::Value::String(direction.clone()))
                .map_err(|_| SyncError::Internal(format!("bad direction in store: {}", direction)))?,
            status: TableStatus::parse(&status)
                .ok_or_else(|| SyncError::Internal(format!("bad status in store: {}", status)))?,
            error_message: row.try_get("error_message").map_err(SyncError::StateStore)?,
            updated_at: row.try_get("updated_at").map_err(SyncError::StateStore)?,
        })
    }

    fn row_to_conflict(row: &SqliteRow) -> Result<ConflictRecord> {
        let local_image: String = row.try_get("local_image").map_err(SyncError::StateStore)?;
        let cloud_image: String = row.try_get("cloud_image").map_err(SyncError::StateStore)?;
        let conflict_type: String = row.try_get("conflict_type").map_err(SyncError::StateStore)?;
        let strategy: Option<String> = row
            .try_get("resolution_strategy")
            .map_err(SyncError::StateStore)?;
        let resolved_image: Option<String> =
            row.try_get("resolved_image").map_err(SyncError::StateStore)?;

        Ok(ConflictRecord {
            id: row.try_get("id").map_err(SyncError::StateStore)?,
            table_name: row.try_get("table_name").map_err(SyncError::StateStore)?,
            primary_key_value: row
                .try_get("primary_key_value")
                .map_err(SyncError::StateStore)?,
            local_image: image_from_json(&local_image)?,
            cloud_image: image_from_json(&cloud_image)?,
            conflict_type: ConflictKind::parse(&conflict_type).ok_or_else(|| {
                SyncError::Internal(format!("bad conflict type in store: {}", conflict_type))
            })?,
            detected_at: row.try_get("detected_at").map_err(SyncError::StateStore)?,
            resolved: row.try_get("resolved").map_err(SyncError::StateStore)?,
            resolution_strategy: strategy.and_then(|s| {
                serde_json::from_value(serde_json::Value::String(s)).ok()
            }),
            resolved_at: row.try_get("resolved_at").map_err(SyncError::StateStore)?,
            resolved_image: resolved_image.map(|s| image_from_json(&s)).transpose()?,
        })
    }

    fn row_to_run(row: &SqliteRow) -> Result<RunRecord> {
        let status: String = row.try_get("status").map_err(SyncError::StateStore)?;
        let tables: String = row.try_get("tables_synced").map_err(SyncError::StateStore)?;
        Ok(RunRecord {
            id: row.try_get("id").map_err(SyncError::StateStore)?,
            started_at: row.try_get("started_at").map_err(SyncError::StateStore)?,
            completed_at: row.try_get("completed_at").map_err(SyncError::StateStore)?,
            direction: row.try_get("direction").map_err(SyncError::StateStore)?,
            tables: tables_from_json(&tables),
            total_rows_applied: row
                .try_get::<i64, _>("total_rows_applied")
                .map_err(SyncError::StateStore)? as u64,
            conflicts_detected: row
                .try_get::<i64, _>("conflicts_detected")
                .map_err(SyncError::StateStore)? as u64,
            status: RunStatus::parse(&status)
                .ok_or_else(|| SyncError::Internal(format!("bad run status in store: {}", status)))?,
            error_message: row.try_get("error_message").map_err(SyncError::StateStore)?,
        })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get_position(
        &self,
        table: &str,
        direction: SyncDirection,
    ) -> Result<Option<TablePosition>> {
        let row = sqlx::query("SELECT * FROM sync_state WHERE table_name = ? AND direction = ?")
            .bind(table)
            .bind(direction.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(SyncError::StateStore)?;
        row.as_ref().map(Self::row_to_position).transpose()
    }

    async fn upsert_position(&self, position: &TablePosition) -> Result<()> {
        let pool = &self.pool;
        with_busy_retry("upsert_position", || async {
            sqlx::query(
                r#"
                INSERT INTO sync_state
                    (table_name, direction, last_file, last_offset,
                     last_source_timestamp, rows_applied, status,
                     error_message, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(table_name, direction) DO UPDATE SET
                    last_file = excluded.last_file,
                    last_offset = excluded.last_offset,
                    last_source_timestamp = excluded.last_source_timestamp,
                    rows_applied = excluded.rows_applied,
                    status = excluded.status,
                    error_message = excluded.error_message,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&position.table_name)
            .bind(position.direction.as_str())
            .bind(&position.last_file)
            .bind(position.last_offset as i64)
            .bind(position.last_source_timestamp)
            .bind(position.rows_applied as i64)
            .bind(position.status.as_str())
            .bind(&position.error_message)
            .bind(position.updated_at)
            .execute(pool)
            .await
        })
        .await
        .map_err(SyncError::StateStore)?;
        Ok(())
    }

    async fn create_conflict(&self, conflict: &ConflictRecord) -> Result<()> {
        let open: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conflicts WHERE table_name = ? AND primary_key_value = ? AND resolved = 0",
        )
        .bind(&conflict.table_name)
        .bind(&conflict.primary_key_value)
        .fetch_one(&self.pool)
        .await
        .map_err(SyncError::StateStore)?;

        if open > 0 {
            return Err(SyncError::ConflictExists {
                table: conflict.table_name.clone(),
                pk: conflict.primary_key_value.clone(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO conflicts
                (id, table_name, primary_key_value, local_image, cloud_image,
                 conflict_type, detected_at, resolved, resolution_strategy,
                 resolved_at, resolved_image)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conflict.id)
        .bind(&conflict.table_name)
        .bind(&conflict.primary_key_value)
        .bind(image_to_json(&conflict.local_image))
        .bind(image_to_json(&conflict.cloud_image))
        .bind(conflict.conflict_type.as_str())
        .bind(conflict.detected_at)
        .bind(conflict.resolved)
        .bind(conflict.resolution_strategy.map(|s| s.as_str()))
        .bind(conflict.resolved_at)
        .bind(conflict.resolved_image.as_ref().map(image_to_json))
        .execute(&self.pool)
        .await
        .map_err(SyncError::StateStore)?;
        Ok(())
    }

    async fn get_conflict(&self, id: &str) -> Result<Option<ConflictRecord>> {
        let row = sqlx::query("SELECT * FROM conflicts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SyncError::StateStore)?;
        row.as_ref().map(Self::row_to_conflict).transpose()
    }

    async fn list_conflicts(
        &self,
        resolved: Option<bool>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConflictRecord>> {
        let rows = match resolved {
            Some(resolved) => {
                sqlx::query(
                    "SELECT * FROM conflicts WHERE resolved = ? ORDER BY detected_at DESC LIMIT ? OFFSET ?",
                )
                .bind(resolved)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM conflicts ORDER BY detected_at DESC LIMIT ? OFFSET ?")
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(SyncError::StateStore)?;

        rows.iter().map(Self::row_to_conflict).collect()
    }

    async fn resolve_conflict(
        &self,
        id: &str,
        strategy: ConflictResolution,
        resolved_image: &RowImage,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE conflicts
            SET resolved = 1, resolution_strategy = ?, resolved_image = ?, resolved_at = ?
            WHERE id = ?
            "#,
        )
        .bind(strategy.as_str())
        .bind(image_to_json(resolved_image))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(SyncError::StateStore)?;

        if result.rows_affected() == 0 {
            return Err(SyncError::Internal(format!("conflict {} not found", id)));
        }
        Ok(())
    }

    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_history
                (id, started_at, completed_at, direction, tables_synced,
                 total_rows_applied, conflicts_detected, status, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.direction)
        .bind(tables_to_json(&run.tables))
        .bind(run.total_rows_applied as i64)
        .bind(run.conflicts_detected as i64)
        .bind(run.status.as_str())
        .bind(&run.error_message)
        .execute(&self.pool)
        .await
        .map_err(SyncError::StateStore)?;
        Ok(())
    }

    async fn update_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_history
            SET completed_at = ?, total_rows_applied = ?, conflicts_detected = ?,
                status = ?, error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(run.completed_at)
        .bind(run.total_rows_applied as i64)
        .bind(run.conflicts_detected as i64)
        .bind(run.status.as_str())
        .bind(&run.error_message)
        .bind(&run.id)
        .execute(&self.pool)
        .await
        .map_err(SyncError::StateStore)?;
        Ok(())
    }

    async fn list_runs(&self, limit: u32, offset: u32) -> Result<Vec<RunRecord>> {
        let rows =
            sqlx::query("SELECT * FROM sync_history ORDER BY started_at DESC LIMIT ? OFFSET ?")
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
                .map_err(SyncError::StateStore)?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!(path = %self.path, "Sqlite state store closed");
    }
}
