// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable sync state: positions, conflicts, and run history.
//!
//! The [`StateStore`] trait is the crate's persistence seam. Two backends
//! implement it: [`MySqlStateStore`](mysql::MySqlStateStore) for a shared
//! server-side store and [`SqliteStateStore`](sqlite::SqliteStateStore) for
//! a local file (the default). Both create their schema on open.
//!
//! # Position Semantics
//!
//! `sync_state` stores the **last successfully committed** position per
//! `(table, direction)`. The two halves of a bidirectional run read from
//! different binlogs, so their positions live in different log spaces and
//! each direction owns its own row — one half can never clobber the
//! other's resume point. On restart, a listener resumes from the minimum
//! stored position across all configured tables for its direction, and
//! idempotent DML makes the overlap safe:
//!
//! ```text
//! apply batch → commit at destination → upsert position
//!               (crash here = re-apply same batch, upsert is a no-op)
//! ```
//!
//! # Conflict Uniqueness
//!
//! `create_conflict` rejects a second unresolved conflict for the same
//! `(table_name, primary_key_value)` with
//! [`SyncError::ConflictExists`](crate::error::SyncError::ConflictExists).
//! Writes for one table are serialized by that table's owning applier, so
//! the check-then-insert in the backends is race-free in practice.

pub mod mysql;
pub mod sqlite;

use crate::config::{ConflictResolution, StateStorageConfig, StoreType, SyncDirection};
use crate::conflict::ConflictKind;
use crate::error::{Result, SyncError};
use crate::event::{BinlogPosition, RowImage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use mysql::MySqlStateStore;
pub use sqlite::SqliteStateStore;

/// Per-table sync status as persisted in `sync_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Idle,
    Running,
    Error,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Idle => "idle",
            TableStatus::Running => "running",
            TableStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(TableStatus::Idle),
            "running" => Some(TableStatus::Running),
            "error" => Some(TableStatus::Error),
            _ => None,
        }
    }
}

/// Durable resume point for one table in one direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablePosition {
    pub table_name: String,
    pub last_file: String,
    pub last_offset: u64,
    /// Wall-clock seconds from the source log header of the last applied event.
    pub last_source_timestamp: i64,
    /// Monotonic counter of rows applied for this table.
    pub rows_applied: u64,
    pub direction: SyncDirection,
    pub status: TableStatus,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TablePosition {
    /// The stored position as a [`BinlogPosition`].
    pub fn position(&self) -> BinlogPosition {
        BinlogPosition::new(self.last_file.clone(), self.last_offset)
    }
}

/// A recorded divergence awaiting (or after) resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub table_name: String,
    pub primary_key_value: String,
    pub local_image: RowImage,
    pub cloud_image: RowImage,
    pub conflict_type: ConflictKind,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolution_strategy: Option<ConflictResolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_image: Option<RowImage>,
}

impl ConflictRecord {
    /// New unresolved conflict with a fresh id.
    pub fn new(
        table_name: impl Into<String>,
        primary_key_value: impl Into<String>,
        local_image: RowImage,
        cloud_image: RowImage,
        conflict_type: ConflictKind,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            table_name: table_name.into(),
            primary_key_value: primary_key_value.into(),
            local_image,
            cloud_image,
            conflict_type,
            detected_at: Utc::now(),
            resolved: false,
            resolution_strategy: None,
            resolved_at: None,
            resolved_image: None,
        }
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Audit record for one run of the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `local_to_cloud`, `cloud_to_local`, or `bidirectional`.
    pub direction: String,
    pub tables: Vec<String>,
    pub total_rows_applied: u64,
    pub conflicts_detected: u64,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

impl RunRecord {
    /// New running record with a fresh id.
    pub fn begin(direction: impl Into<String>, tables: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            completed_at: None,
            direction: direction.into(),
            tables,
            total_rows_applied: 0,
            conflicts_detected: 0,
            status: RunStatus::Running,
            error_message: None,
        }
    }
}

/// Operations the pipeline requires from durable state.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Fetch the stored position for a table in one direction, if any.
    async fn get_position(
        &self,
        table: &str,
        direction: SyncDirection,
    ) -> Result<Option<TablePosition>>;

    /// Insert or update a position (idempotent by `(table_name, direction)`).
    async fn upsert_position(&self, position: &TablePosition) -> Result<()>;

    /// Record a new conflict.
    ///
    /// Fails with [`SyncError::ConflictExists`] if an unresolved conflict
    /// already exists for the same `(table_name, primary_key_value)`.
    async fn create_conflict(&self, conflict: &ConflictRecord) -> Result<()>;

    /// Fetch a conflict by id.
    async fn get_conflict(&self, id: &str) -> Result<Option<ConflictRecord>>;

    /// List conflicts, optionally filtered by resolution state.
    async fn list_conflicts(
        &self,
        resolved: Option<bool>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConflictRecord>>;

    /// Mark a conflict resolved, preserving both original images.
    async fn resolve_conflict(
        &self,
        id: &str,
        strategy: ConflictResolution,
        resolved_image: &RowImage,
    ) -> Result<()>;

    /// Insert a new run record.
    async fn create_run(&self, run: &RunRecord) -> Result<()>;

    /// Update an existing run record (totals, completion, status).
    async fn update_run(&self, run: &RunRecord) -> Result<()>;

    /// List run records, newest first.
    async fn list_runs(&self, limit: u32, offset: u32) -> Result<Vec<RunRecord>>;

    /// Close the underlying pool gracefully.
    async fn close(&self);
}

/// Open the configured state store backend.
pub async fn open_store(config: &StateStorageConfig) -> Result<Arc<dyn StateStore>> {
    match config.store_type {
        StoreType::Sqlite => Ok(Arc::new(SqliteStateStore::open(&config.file_path).await?)),
        StoreType::Mysql => Ok(Arc::new(MySqlStateStore::open(config).await?)),
    }
}

pub(crate) fn image_to_json(image: &RowImage) -> String {
    serde_json::to_string(image).unwrap_or_else(|_| "{}".to_string())
}

pub(crate) fn image_from_json(json: &str) -> Result<RowImage> {
    serde_json::from_str(json)
        .map_err(|e| SyncError::Internal(format!("corrupt row image in store: {}", e)))
}

pub(crate) fn tables_to_json(tables: &[String]) -> String {
    serde_json::to_string(tables).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn tables_from_json(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_status_roundtrip() {
        for status in [TableStatus::Idle, TableStatus::Running, TableStatus::Error] {
            assert_eq!(TableStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TableStatus::parse("bogus"), None);
    }

    #[test]
    fn test_run_status_roundtrip() {
        for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse(""), None);
    }

    #[test]
    fn test_table_position_accessor() {
        let position = TablePosition {
            table_name: "users".to_string(),
            last_file: "mysql-bin.000007".to_string(),
            last_offset: 1234,
            last_source_timestamp: 1_700_000_000,
            rows_applied: 10,
            direction: SyncDirection::LocalToCloud,
            status: TableStatus::Running,
            error_message: None,
            updated_at: Utc::now(),
        };
        assert_eq!(
            position.position(),
            BinlogPosition::new("mysql-bin.000007", 1234)
        );
    }

    #[test]
    fn test_conflict_record_new_defaults() {
        let mut local = RowImage::new();
        local.insert("id".to_string(), json!(1));
        let conflict = ConflictRecord::new(
            "users",
            "1",
            local,
            RowImage::new(),
            ConflictKind::DataMismatch,
        );
        assert!(!conflict.resolved);
        assert!(conflict.resolution_strategy.is_none());
        assert!(conflict.resolved_at.is_none());
        assert!(conflict.resolved_image.is_none());
        assert_eq!(conflict.id.len(), 36); // uuid v4
    }

    #[test]
    fn test_run_record_begin_defaults() {
        let run = RunRecord::begin("bidirectional", vec!["users".to_string()]);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.completed_at.is_none());
        assert_eq!(run.total_rows_applied, 0);
        assert_eq!(run.tables, vec!["users".to_string()]);
    }

    #[test]
    fn test_image_json_roundtrip() {
        let mut image = RowImage::new();
        image.insert("id".to_string(), json!(5));
        image.insert("name".to_string(), json!("x"));

        let json = image_to_json(&image);
        let parsed = image_from_json(&json).unwrap();
        assert_eq!(parsed, image);
    }

    #[test]
    fn test_image_from_json_corrupt() {
        assert!(image_from_json("not json").is_err());
    }

    #[test]
    fn test_tables_json_roundtrip() {
        let tables = vec!["a".to_string(), "b".to_string()];
        assert_eq!(tables_from_json(&tables_to_json(&tables)), tables);
        assert!(tables_from_json("garbage").is_empty());
    }
}
