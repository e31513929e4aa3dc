// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync service.
//!
//! This module defines the error types used throughout the change-propagation
//! pipeline. Errors are categorized by their source (source stream, destination,
//! state store, etc.) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Connect` | Yes | Replication handshake failed, source unreachable |
//! | `Stream` | Yes | Binlog stream dropped mid-read |
//! | `Destination` | Yes | Destination transaction failed (timeout, deadlock) |
//! | `StateStore` | Yes | State store write failed (bounded by write deadline) |
//! | `PositionInvalid` | No | Source has purged the requested binlog file |
//! | `SchemaMismatch` | No | Event column layout does not match the table |
//! | `Config` | No | Configuration invalid |
//! | `AlreadyRunning` | No | Concurrent start while a run is active |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Run is being cancelled |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`SyncError::is_retryable()`] to determine if an operation should be
//! retried with backoff. Retryable errors indicate transient network or
//! availability issues. Non-retryable errors indicate configuration problems,
//! purged history, or bugs — the worker pool classifies them into skip,
//! quarantine, or escalation (see the applier module).

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during synchronization.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Replication handshake with the source failed.
    ///
    /// Occurs when the listener cannot register as a replica
    /// (network failure, bad credentials, missing REPLICATION SLAVE grant).
    /// Retryable with exponential backoff.
    #[error("connect failed ({endpoint}): {message}")]
    Connect { endpoint: String, message: String },

    /// The source has purged the requested binlog file.
    ///
    /// Fatal for the run: the stored resume position no longer exists on the
    /// source and replaying from it is impossible. Requires operator action
    /// (typically a full-table reconcile).
    #[error("binlog position invalid: {file} has been purged from the source")]
    PositionInvalid { file: String },

    /// The replication stream dropped mid-read.
    ///
    /// Retryable: the listener reconnects with backoff and resumes from the
    /// last durably stored position.
    #[error("binlog stream error ({operation}): {message}")]
    Stream {
        operation: String,
        message: String,
        #[source]
        source: Option<mysql_async::Error>,
    },

    /// A destination transaction failed.
    ///
    /// Timeouts and deadlocks are transient and retryable; the batch is
    /// rolled back and no position is advanced.
    #[error("destination error (table {table}): {source}")]
    Destination {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// A state store read or write failed.
    ///
    /// Retried up to the write deadline; three consecutive failures
    /// escalate the run to `failed`.
    #[error("state store error: {0}")]
    StateStore(#[source] sqlx::Error),

    /// A per-operation deadline elapsed.
    ///
    /// Destination transactions are bounded to 30s, state store writes to
    /// 5s. Retryable like any other transient stall.
    #[error("timeout during {operation} after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Event column layout does not match the destination table.
    ///
    /// Not retryable — the offending row is skipped and counted; past the
    /// per-table threshold the table is quarantined.
    #[error("schema mismatch on {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },

    /// An unresolved conflict already exists for this `(table, pk)`.
    ///
    /// Not an operational failure: the divergence is already recorded and
    /// awaiting resolution.
    #[error("unresolved conflict already recorded for {table} pk {pk}")]
    ConflictExists { table: String, pk: String },

    /// Invalid or missing configuration.
    ///
    /// Detected at manager start; prevents the transition out of `idle`.
    #[error("configuration error: {0}")]
    Config(String),

    /// A run is already active.
    #[error("sync is already running")]
    AlreadyRunning,

    /// Lifecycle state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state.
    /// Not retryable - indicates a bug in the caller.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The run is being cancelled.
    ///
    /// Returned from suspension points once the shutdown signal fires.
    #[error("shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a `Connect` error.
    pub fn connect(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a `Stream` error from a driver error.
    pub fn stream(operation: impl Into<String>, source: mysql_async::Error) -> Self {
        Self::Stream {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a `Stream` error without a driver source.
    pub fn stream_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stream {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a `Destination` error.
    pub fn destination(table: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Destination {
            table: table.into(),
            source,
        }
    }

    /// Create a `SchemaMismatch` error.
    pub fn schema_mismatch(table: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            table: table.into(),
            detail: detail.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. } => true,
            Self::Stream { .. } => true,
            Self::Destination { .. } => true,
            Self::StateStore(_) => true,
            Self::Timeout { .. } => true,
            Self::PositionInvalid { .. } => false, // History is gone
            Self::SchemaMismatch { .. } => false,  // Skip-and-count, never retry
            Self::ConflictExists { .. } => false,
            Self::Config(_) => false,
            Self::AlreadyRunning => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error is fatal for the whole run.
    ///
    /// Fatal errors move the manager to `failed`; everything else is handled
    /// at the worker or listener level.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PositionInvalid { .. } | Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_connect() {
        let err = SyncError::connect("db-local:3306", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("db-local:3306"));
    }

    #[test]
    fn test_is_retryable_stream() {
        let err = SyncError::stream_msg("read_event", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("read_event"));
    }

    #[test]
    fn test_is_retryable_destination() {
        let err = SyncError::destination("users", sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("users"));
    }

    #[test]
    fn test_is_retryable_state_store() {
        let err = SyncError::StateStore(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_is_retryable_timeout() {
        let err = SyncError::Timeout {
            operation: "destination_tx".to_string(),
            seconds: 30,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("destination_tx"));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn test_not_retryable_position_invalid() {
        let err = SyncError::PositionInvalid {
            file: "mysql-bin.000042".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.is_fatal());
        assert!(err.to_string().contains("mysql-bin.000042"));
    }

    #[test]
    fn test_not_retryable_schema_mismatch() {
        let err = SyncError::schema_mismatch("orders", "event has 7 columns, table has 6");
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = SyncError::Config("no tables configured".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_not_retryable_already_running() {
        let err = SyncError::AlreadyRunning;
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "sync is already running");
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = SyncError::InvalidState {
            expected: "Idle".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Idle"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_not_retryable_shutdown() {
        let err = SyncError::Shutdown;
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_conflict_exists() {
        let err = SyncError::ConflictExists {
            table: "users".to_string(),
            pk: "5".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("users"));
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn test_not_retryable_internal() {
        let err = SyncError::Internal("unexpected".to_string());
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_formatting() {
        let err = SyncError::Stream {
            operation: "register_replica".to_string(),
            message: "timeout".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("binlog stream error"));
        assert!(msg.contains("register_replica"));
        assert!(msg.contains("timeout"));
    }
}
