//! Conflict detection and resolution for bidirectional sync.
//!
//! Two row images for the same primary key are in conflict iff their
//! canonical content hashes differ (see [`crate::canonical`]). The engine
//! classifies the divergence, then applies the table's configured strategy:
//!
//! - `last_write_wins` — the image with the strictly greater
//!   `timestamp_column` wins; ties break by the table's declared side
//!   precedence; a missing or unparsable timestamp degrades to `manual`.
//! - `source_priority` — the declared side always wins.
//! - `manual` — the conflict is persisted with both images and the row is
//!   left untouched until resolved through the control surface.
//!
//! The engine is stateless across calls; the per-`(table, pk)` uniqueness
//! invariant is enforced by the state store. The [`RecentApplies`] cache is
//! how the applier learns that the opposite direction recently touched a
//! key: it is advisory only, and losing it merely skips some short-circuit
//! checks.

use crate::canonical::images_equal;
use crate::config::{ConflictResolution, PrioritySide, SyncDirection, TableConfig};
use crate::event::{BinlogPosition, ChangeKind, RowImage};
use chrono::{DateTime, NaiveDateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Kind of divergence between the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    DataMismatch,
    DeleteVsUpdate,
    InsertCollision,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::DataMismatch => "data_mismatch",
            ConflictKind::DeleteVsUpdate => "delete_vs_update",
            ConflictKind::InsertCollision => "insert_collision",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "data_mismatch" => Some(ConflictKind::DataMismatch),
            "delete_vs_update" => Some(ConflictKind::DeleteVsUpdate),
            "insert_collision" => Some(ConflictKind::InsertCollision),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running a resolution strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    /// Apply the winning image (`None` = the deletion wins).
    Resolved {
        winner: Option<RowImage>,
        strategy: ConflictResolution,
        winning_side: PrioritySide,
    },
    /// Persist the conflict and skip the change at the applier.
    Unresolved,
}

impl StrategyOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, StrategyOutcome::Resolved { .. })
    }
}

/// Stateless conflict detector/resolver.
#[derive(Debug, Default, Clone)]
pub struct ConflictEngine;

impl ConflictEngine {
    pub fn new() -> Self {
        Self
    }

    /// Columns excluded from content comparison for a table.
    fn ignore_list(table: &TableConfig) -> Vec<String> {
        table.timestamp_column.iter().cloned().collect()
    }

    /// Decide whether the two sides diverge, and how.
    ///
    /// `local` / `cloud` are the row's current images on each side (`None`
    /// = the row does not exist there). `incoming_kind` is the operation
    /// that triggered the check.
    pub fn detect(
        &self,
        table: &TableConfig,
        local: Option<&RowImage>,
        cloud: Option<&RowImage>,
        incoming_kind: ChangeKind,
    ) -> Option<ConflictKind> {
        let ignore = Self::ignore_list(table);
        match (local, cloud) {
            (Some(local), Some(cloud)) => {
                if images_equal(local, cloud, &ignore) {
                    None
                } else if incoming_kind == ChangeKind::Insert {
                    Some(ConflictKind::InsertCollision)
                } else {
                    Some(ConflictKind::DataMismatch)
                }
            }
            (Some(_), None) | (None, Some(_)) => match incoming_kind {
                // One side removed the row while the other still carries a
                // mutation for it.
                ChangeKind::Update | ChangeKind::Delete => Some(ConflictKind::DeleteVsUpdate),
                ChangeKind::Insert => None,
            },
            (None, None) => None,
        }
    }

    /// Run the table's strategy over a detected conflict.
    pub fn resolve(
        &self,
        table: &TableConfig,
        local: Option<&RowImage>,
        cloud: Option<&RowImage>,
    ) -> StrategyOutcome {
        match table.conflict_resolution {
            ConflictResolution::Manual => StrategyOutcome::Unresolved,
            ConflictResolution::SourcePriority => {
                let winner = match table.priority_side {
                    PrioritySide::Local => local,
                    PrioritySide::Cloud => cloud,
                };
                StrategyOutcome::Resolved {
                    winner: winner.cloned(),
                    strategy: ConflictResolution::SourcePriority,
                    winning_side: table.priority_side,
                }
            }
            ConflictResolution::LastWriteWins => self.last_write_wins(table, local, cloud),
        }
    }

    fn last_write_wins(
        &self,
        table: &TableConfig,
        local: Option<&RowImage>,
        cloud: Option<&RowImage>,
    ) -> StrategyOutcome {
        let column = match table.timestamp_column.as_deref() {
            Some(column) => column,
            None => return StrategyOutcome::Unresolved,
        };

        // A deleted side carries no timestamp to compare against.
        let (local, cloud) = match (local, cloud) {
            (Some(l), Some(c)) => (l, c),
            _ => return StrategyOutcome::Unresolved,
        };

        let local_ts = local.get(column).and_then(parse_timestamp);
        let cloud_ts = cloud.get(column).and_then(parse_timestamp);

        match (local_ts, cloud_ts) {
            (Some(lt), Some(ct)) => {
                let winning_side = if lt > ct {
                    PrioritySide::Local
                } else if ct > lt {
                    PrioritySide::Cloud
                } else {
                    table.priority_side
                };
                let winner = match winning_side {
                    PrioritySide::Local => local.clone(),
                    PrioritySide::Cloud => cloud.clone(),
                };
                StrategyOutcome::Resolved {
                    winner: Some(winner),
                    strategy: ConflictResolution::LastWriteWins,
                    winning_side,
                }
            }
            // Missing or unparsable timestamp: never guess, never throw.
            _ => StrategyOutcome::Unresolved,
        }
    }
}

/// Parse a timestamp column value.
///
/// Accepts RFC 3339 strings, MySQL DATETIME text (`2026-01-02 03:04:05`,
/// with optional fractional seconds), and integer epoch seconds.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(naive.and_utc());
                }
            }
            None
        }
        serde_json::Value::Number(n) => {
            let secs = n.as_i64()?;
            DateTime::from_timestamp(secs, 0)
        }
        _ => None,
    }
}

/// What the applier remembers about a recently applied change.
#[derive(Debug, Clone)]
pub struct AppliedMark {
    pub position: BinlogPosition,
    pub direction: SyncDirection,
    pub source_timestamp: u32,
}

/// Per-table LRU of `pk → last applied change`, shared by both directions.
///
/// The applier of each direction records what it writes; before applying an
/// UPDATE/DELETE it asks whether the *opposite* direction recently touched
/// the same key, which is the trigger for a conflict check.
pub struct RecentApplies {
    tables: Mutex<HashMap<String, LruCache<String, AppliedMark>>>,
    per_table_capacity: NonZeroUsize,
}

/// Default per-table capacity of the recent-applies cache.
pub const DEFAULT_RECENT_CAPACITY: usize = 1024;

impl RecentApplies {
    pub fn new(per_table_capacity: usize) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            per_table_capacity: NonZeroUsize::new(per_table_capacity.max(1))
                .unwrap_or(NonZeroUsize::MIN),
        }
    }

    /// Record that `pk` of `table` was just applied.
    pub fn note(&self, table: &str, pk: &str, mark: AppliedMark) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .entry(table.to_string())
            .or_insert_with(|| LruCache::new(self.per_table_capacity))
            .put(pk.to_string(), mark);
    }

    /// Look up a recent apply of `pk` by the opposite direction.
    pub fn opposite_of(
        &self,
        table: &str,
        pk: &str,
        direction: SyncDirection,
    ) -> Option<AppliedMark> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let cache = tables.get_mut(table)?;
        let mark = cache.get(pk)?;
        if mark.direction != direction {
            Some(mark.clone())
        } else {
            None
        }
    }

    /// Number of tracked keys for a table (diagnostics).
    pub fn len(&self, table: &str) -> usize {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table).map(|c| c.len()).unwrap_or(0)
    }
}

impl Default for RecentApplies {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_CAPACITY)
    }
}
