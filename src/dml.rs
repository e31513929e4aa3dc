//! Idempotent DML generation from row images.
//!
//! All statements are replay-safe so that a crash between a payload commit
//! and the position advance never corrupts the destination:
//!
//! - INSERT uses upsert semantics keyed on the primary key.
//! - UPDATE targets the primary key; the applier falls back to an upsert of
//!   the after-image when no row matched.
//! - DELETE by primary key treats absence as success.
//!
//! Column order is the lexicographic iteration order of
//! [`RowImage`](crate::event::RowImage), the same order content hashing
//! uses. Identifiers are backtick-quoted with embedded backticks doubled;
//! values are always bound as statement parameters, never interpolated into
//! the SQL text.

use crate::error::{Result, SyncError};
use crate::event::RowImage;

/// One generated statement: SQL text plus its bind parameters in order.
#[derive(Debug, Clone, PartialEq)]
pub struct DmlStatement {
    pub sql: String,
    pub params: Vec<serde_json::Value>,
}

/// Backtick-quote a MySQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Insert-or-replace a full row image, keyed on the primary key.
pub fn upsert(table: &str, pk_column: &str, image: &RowImage) -> Result<DmlStatement> {
    if image.is_empty() {
        return Err(SyncError::schema_mismatch(table, "empty row image"));
    }

    let columns: Vec<String> = image.keys().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<&str> = image.keys().map(|_| "?").collect();
    let assignments: Vec<String> = image
        .keys()
        .filter(|c| c.as_str() != pk_column)
        .map(|c| {
            let quoted = quote_ident(c);
            format!("{} = VALUES({})", quoted, quoted)
        })
        .collect();

    // All-key tables have nothing to update; a self-assignment keeps the
    // statement valid and the replay a no-op.
    let assignments = if assignments.is_empty() {
        format!("{pk} = {pk}", pk = quote_ident(pk_column))
    } else {
        assignments.join(", ")
    };

    Ok(DmlStatement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
            quote_ident(table),
            columns.join(", "),
            placeholders.join(", "),
            assignments
        ),
        params: image.values().cloned().collect(),
    })
}

/// Update a row by primary key using the after-image.
///
/// `where_pk` is the primary-key value the row currently has (the
/// before-image's, so a key-changing update still finds its row).
pub fn update(
    table: &str,
    pk_column: &str,
    image: &RowImage,
    where_pk: &serde_json::Value,
) -> Result<DmlStatement> {
    if image.is_empty() {
        return Err(SyncError::schema_mismatch(table, "empty row image"));
    }

    let assignments: Vec<String> = image
        .keys()
        .map(|c| format!("{} = ?", quote_ident(c)))
        .collect();

    let mut params: Vec<serde_json::Value> = image.values().cloned().collect();
    params.push(where_pk.clone());

    Ok(DmlStatement {
        sql: format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(table),
            assignments.join(", "),
            quote_ident(pk_column)
        ),
        params,
    })
}

/// Delete a row by primary key. Absence is not an error.
pub fn delete(table: &str, pk_column: &str, pk: &serde_json::Value) -> DmlStatement {
    DmlStatement {
        sql: format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(table),
            quote_ident(pk_column)
        ),
        params: vec![pk.clone()],
    }
}
