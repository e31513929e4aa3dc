// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! MySQL-backed state store.
//!
//! Used when positions, conflicts, and history should live on a shared
//! server (typically the cloud instance) instead of a local file. The SQL
//! surface mirrors [`SqliteStateStore`](super::sqlite::SqliteStateStore);
//! only DDL dialect and upsert syntax differ.

use super::{
    image_from_json, image_to_json, tables_from_json, tables_to_json, ConflictRecord, RunRecord,
    RunStatus, StateStore, TablePosition, TableStatus,
};
use crate::config::{ConflictResolution, StateStorageConfig, SyncDirection};
use crate::conflict::ConflictKind;
use crate::error::{Result, SyncError};
use crate::event::RowImage;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_state (
        table_name            VARCHAR(255) NOT NULL,
        direction             VARCHAR(32) NOT NULL,
        last_file             VARCHAR(255) NOT NULL,
        last_offset           BIGINT UNSIGNED NOT NULL,
        last_source_timestamp BIGINT NOT NULL DEFAULT 0,
        rows_applied          BIGINT UNSIGNED NOT NULL DEFAULT 0,
        status                VARCHAR(16) NOT NULL,
        error_message         TEXT,
        updated_at            DATETIME(3) NOT NULL,
        PRIMARY KEY (table_name, direction)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conflicts (
        id                  VARCHAR(36) PRIMARY KEY,
        table_name          VARCHAR(255) NOT NULL,
        primary_key_value   VARCHAR(255) NOT NULL,
        local_image         JSON NOT NULL,
        cloud_image         JSON NOT NULL,
        conflict_type       VARCHAR(32) NOT NULL,
        detected_at         DATETIME(3) NOT NULL,
        resolved            BOOLEAN NOT NULL DEFAULT FALSE,
        resolution_strategy VARCHAR(32),
        resolved_at         DATETIME(3),
        resolved_image      JSON,
        KEY idx_conflicts_resolved (resolved),
        KEY idx_conflicts_table (table_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_history (
        id                 VARCHAR(36) PRIMARY KEY,
        started_at         DATETIME(3) NOT NULL,
        completed_at       DATETIME(3),
        direction          VARCHAR(32) NOT NULL,
        tables_synced      JSON NOT NULL,
        total_rows_applied BIGINT UNSIGNED NOT NULL DEFAULT 0,
        conflicts_detected BIGINT UNSIGNED NOT NULL DEFAULT 0,
        status             VARCHAR(16) NOT NULL,
        error_message      TEXT,
        KEY idx_history_started (started_at)
    )
    "#,
];

/// State store backed by a MySQL database.
pub struct MySqlStateStore {
    pool: MySqlPool,
}

impl MySqlStateStore {
    /// Connect and bootstrap the schema.
    pub async fn open(config: &StateStorageConfig) -> Result<Self> {
        let url = format!(
            "mysql://{}:{}@{}:{}/{}",
            config.user, config.password, config.host, config.port, config.database
        );
        info!(host = %config.host, database = %config.database, "Opening mysql state store");

        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .min_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&url)
            .await
            .map_err(SyncError::StateStore)?;

        for ddl in SCHEMA {
            sqlx::query(ddl)
                .execute(&pool)
                .await
                .map_err(SyncError::StateStore)?;
        }

        Ok(Self { pool })
    }

    fn row_to_position(row: &MySqlRow) -> Result<TablePosition> {
        let direction: String = row.try_get("direction").map_err(SyncError::StateStore)?;
        let status: String = row.try_get("status").map_err(SyncError::StateStore)?;
        Ok(TablePosition {
            table_name: row.try_get("table_name").map_err(SyncError::StateStore)?,
            last_file: row.try_get("last_file").map_err(SyncError::StateStore)?,
            last_offset: row.try_get("last_offset").map_err(SyncError::StateStore)?,
            last_source_timestamp: row
                .try_get("last_source_timestamp")
                .map_err(SyncError::StateStore)?,
            rows_applied: row.try_get("rows_applied").map_err(SyncError::StateStore)?,
            direction: serde_json::from_value(serde_json::Value::String(direction.clone()))
                .map_err(|_| SyncError::Internal(format!("bad direction in store: {}", direction)))?,
            status: TableStatus::parse(&status)
                .ok_or_else(|| SyncError::Internal(format!("bad status in store: {}", status)))?,
            error_message: row.try_get("error_message").map_err(SyncError::StateStore)?,
            updated_at: row.try_get("updated_at").map_err(SyncError::StateStore)?,
        })
    }

    fn row_to_conflict(row: &MySqlRow) -> Result<ConflictRecord> {
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
            resolution_strategy: strategy
                .and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok()),
            resolved_at: row.try_get("resolved_at").map_err(SyncError::StateStore)?,
            resolved_image: resolved_image.map(|s| image_from_json(&s)).transpose()?,
        })
    }

    fn row_to_run(row: &MySqlRow) -> Result<RunRecord> {
        let status: String = row.try_get("status").map_err(SyncError::StateStore)?;
        let tables: String = row.try_get("tables_synced").map_err(SyncError::StateStore)?;
        Ok(RunRecord {
            id: row.try_get("id").map_err(SyncError::StateStore)?,
            started_at: row.try_get("started_at").map_err(SyncError::StateStore)?,
            completed_at: row.try_get("completed_at").map_err(SyncError::StateStore)?,
            direction: row.try_get("direction").map_err(SyncError::StateStore)?,
            tables: tables_from_json(&tables),
            total_rows_applied: row
                .try_get("total_rows_applied")
                .map_err(SyncError::StateStore)?,
            conflicts_detected: row
                .try_get("conflicts_detected")
                .map_err(SyncError::StateStore)?,
            status: RunStatus::parse(&status)
                .ok_or_else(|| SyncError::Internal(format!("bad run status in store: {}", status)))?,
            error_message: row.try_get("error_message").map_err(SyncError::StateStore)?,
        })
    }
}

#[async_trait]
impl StateStore for MySqlStateStore {
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
        sqlx::query(
            r#"
            INSERT INTO sync_state
                (table_name, direction, last_file, last_offset,
                 last_source_timestamp, rows_applied, status,
                 error_message, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                last_file = VALUES(last_file),
                last_offset = VALUES(last_offset),
                last_source_timestamp = VALUES(last_source_timestamp),
                rows_applied = VALUES(rows_applied),
                status = VALUES(status),
                error_message = VALUES(error_message),
                updated_at = VALUES(updated_at)
            "#,
        )
        .bind(&position.table_name)
        .bind(position.direction.as_str())
        .bind(&position.last_file)
        .bind(position.last_offset)
        .bind(position.last_source_timestamp)
        .bind(position.rows_applied)
        .bind(position.status.as_str())
        .bind(&position.error_message)
        .bind(position.updated_at)
        .execute(&self.pool)
        .await
        .map_err(SyncError::StateStore)?;
        Ok(())
    }

    async fn create_conflict(&self, conflict: &ConflictRecord) -> Result<()> {
        let open: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conflicts WHERE table_name = ? AND primary_key_value = ? AND resolved = FALSE",
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
            SET resolved = TRUE, resolution_strategy = ?, resolved_image = ?, resolved_at = ?
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
        .bind(run.total_rows_applied)
        .bind(run.conflicts_detected)
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
        .bind(run.total_rows_applied)
        .bind(run.conflicts_detected)
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
        debug!("Mysql state store closed");
    }
}
