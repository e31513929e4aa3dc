// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row-change events observed on the source binlog.
//!
//! A [`RowChange`] is one mutation decoded from the replication stream:
//! the operation kind, the affected table, the row images, the wall-clock
//! timestamp from the binlog header, and the [`BinlogPosition`] locating
//! the event in the log.
//!
//! # Position Ordering
//!
//! Binlog positions are `{file, offset}` pairs such as
//! `("mysql-bin.000003", 1524)`. Files carry a numeric suffix that the
//! source increments on rotation, so positions are totally ordered:
//! compare the file's numeric suffix first, then the byte offset.
//! [`BinlogPosition`] implements `Ord` accordingly; lexicographic string
//! comparison is never used (it would break at `...000009` → `...000010`
//! only by luck, and at suffix-width changes not at all).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// One row image: column name → value.
///
/// A `BTreeMap` keeps columns in lexicographic order, which is the canonical
/// order used both for generated DML and for content hashing.
pub type RowImage = BTreeMap<String, serde_json::Value>;

/// The kind of mutation a [`RowChange`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A totally-ordered locator into the source binlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// Binlog file name, e.g. `mysql-bin.000003`.
    pub file: String,
    /// Byte offset within the file.
    pub offset: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    /// Numeric suffix of the binlog file name, e.g. 3 for `mysql-bin.000003`.
    ///
    /// Returns `None` for names without a `.NNNNNN` suffix.
    pub fn file_index(&self) -> Option<u64> {
        self.file.rsplit('.').next().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.file_index(), other.file_index()) {
            (Some(a), Some(b)) => a.cmp(&b).then(self.offset.cmp(&other.offset)),
            // Malformed names: fall back to the full name, then offset.
            _ => self
                .file
                .cmp(&other.file)
                .then(self.offset.cmp(&other.offset)),
        }
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One mutation observed in the source log.
///
/// For `Insert` and `Delete`, `rows` holds one image per changed row and
/// `before_rows` is empty. For `Update`, `before_rows[i]` / `rows[i]` are
/// the before/after pair of the i-th changed row.
#[derive(Debug, Clone)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    /// After-images (or the deleted images for `Delete`).
    pub rows: Vec<RowImage>,
    /// Before-images; populated for `Update` only.
    pub before_rows: Vec<RowImage>,
    /// Wall-clock seconds from the source log header.
    pub source_timestamp: u32,
    /// Location of this event in the source log.
    pub position: BinlogPosition,
}

impl RowChange {
    /// Total number of row images this change applies.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Extract the stringified primary-key value of a row image.
    ///
    /// Stringification keeps the store's `(table, pk)` key uniform across
    /// integer and string keys.
    pub fn primary_key_of(image: &RowImage, pk_column: &str) -> Option<String> {
        image.get(pk_column).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

impl fmt::Display for RowChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}.{} ({} rows) @ {}",
            self.kind,
            self.schema,
            self.table,
            self.rows.len(),
            self.position
        )
    }
}
