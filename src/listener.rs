// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Binlog listener: the source half of the pipeline.
//!
//! Registers against the source MySQL instance as a replication client,
//! decodes row events for the configured allow-list of tables, and deposits
//! [`RowChange`]s into the bounded change queue in log order.
//!
//! # Resume Semantics
//!
//! On every (re)connect the listener resumes from the **minimum position
//! durably stored by any applier** for its tables — not from its own
//! in-memory cursor, which may be ahead of what actually committed. The
//! overlap this produces is safe because all generated DML is idempotent.
//!
//! # State Machine
//!
//! ```text
//! Init → Connecting → Streaming ⇄ Reconnecting
//!                        │
//!                      stop()
//!                        ↓
//!                     Stopped (terminal)
//! ```
//!
//! `Reconnecting` is entered on any I/O error from the stream; backoff is
//! exponential (1s, ×2, capped at 30s) with jitter. A purged resume file
//! (ER 1236 or missing from `SHOW BINARY LOGS`) is fatal and ends the run.

use crate::config::{DatabaseConnection, SyncDirection, TableConfig};
use crate::error::{Result, SyncError};
use crate::event::{BinlogPosition, ChangeKind, RowChange, RowImage};
use crate::metrics;
use crate::queue::ChangeSender;
use crate::resilience::RetryConfig;
use crate::store::StateStore;
use futures::StreamExt;
use mysql_async::binlog::events::EventData;
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::*;
use mysql_async::{BinlogStreamRequest, Conn, Opts, OptsBuilder};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Listener lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Init,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ListenerState::Init => "init",
            ListenerState::Connecting => "connecting",
            ListenerState::Streaming => "streaming",
            ListenerState::Reconnecting => "reconnecting",
            ListenerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// MySQL server error: "could not find first log file name in binary log
/// index file" — the requested binlog has been purged.
const ER_MASTER_FATAL_READ: u16 = 1236;

/// Check whether a driver error means the resume file is gone.
fn is_purged_error(e: &mysql_async::Error) -> bool {
    matches!(e, mysql_async::Error::Server(server) if server.code == ER_MASTER_FATAL_READ)
}

/// Binlog listener for one direction.
pub struct BinlogListener {
    source: DatabaseConnection,
    direction: SyncDirection,
    server_id: u32,
    /// Allow-list of table names within the source database.
    tables: HashSet<String>,
    store: Arc<dyn StateStore>,
    sender: ChangeSender,
    shutdown: watch::Receiver<bool>,
    /// Fallback resume point when no position is stored yet (source tail at
    /// run start).
    initial_position: BinlogPosition,
    retry: RetryConfig,
    state_tx: watch::Sender<ListenerState>,
    state_rx: watch::Receiver<ListenerState>,
    /// Epoch seconds of the last healthy stream activity.
    last_healthy_at: Arc<AtomicI64>,
    /// Ordered column names per table, loaded from information_schema.
    columns: HashMap<String, Vec<String>>,
}

impl BinlogListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: DatabaseConnection,
        tables: &[TableConfig],
        direction: SyncDirection,
        server_id: u32,
        store: Arc<dyn StateStore>,
        sender: ChangeSender,
        shutdown: watch::Receiver<bool>,
        initial_position: BinlogPosition,
        last_healthy_at: Arc<AtomicI64>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ListenerState::Init);
        Self {
            source,
            direction,
            server_id,
            tables: tables.iter().map(|t| t.name.clone()).collect(),
            store,
            sender,
            shutdown,
            initial_position,
            retry: RetryConfig::listener(),
            state_tx,
            state_rx,
            last_healthy_at,
            columns: HashMap::new(),
        }
    }

    /// Watch the listener's state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ListenerState> {
        self.state_rx.clone()
    }

    /// Whether `(schema, table)` passes the allow-list.
    fn is_allowed(&self, schema: &str, table: &str) -> bool {
        schema == self.source.database && self.tables.contains(table)
    }

    fn set_state(&self, state: ListenerState) {
        let _ = self.state_tx.send(state);
    }

    fn mark_healthy(&self) {
        self.last_healthy_at
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    fn replication_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.source.host.clone())
            .tcp_port(self.source.port)
            .user(Some(self.source.replication_user.clone()))
            .pass(Some(self.source.replication_password.clone()))
            .into()
    }

    /// Run until the source stream ends or the shutdown signal fires.
    ///
    /// Stream errors reconnect with backoff; a purged resume position
    /// returns `PositionInvalid` and ends the run.
    pub async fn run(mut self) -> Result<()> {
        let mut attempt = 0usize;
        let result = loop {
            if *self.shutdown.borrow() {
                break Ok(());
            }
            self.set_state(if attempt == 0 {
                ListenerState::Connecting
            } else {
                ListenerState::Reconnecting
            });

            match self.connect_and_stream().await {
                Ok(()) => break Ok(()),
                Err(e) if e.is_fatal() => break Err(e),
                Err(e) if !e.is_retryable() => break Err(e),
                Err(e) => {
                    attempt += 1;
                    metrics::record_reconnect(self.direction.as_str());
                    let delay = self.retry.jittered_delay_for_attempt(attempt);
                    warn!(
                        direction = %self.direction,
                        error = %e,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "Binlog stream error, reconnecting"
                    );
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        self.set_state(ListenerState::Stopped);
        info!(direction = %self.direction, "Binlog listener stopped");
        result
    }

    /// Resume point: the floor of durably stored positions for our tables.
    ///
    /// Positions are stored per `(table, direction)`, so a bidirectional
    /// run's opposite half can never disturb this listener's floor. A
    /// table with no stored position yet contributes the run's initial
    /// position (the source tail captured at launch — anything later would
    /// skip events observed since).
    async fn resume_position(&self) -> Result<BinlogPosition> {
        let mut floor: Option<BinlogPosition> = None;
        for table in &self.tables {
            let position = match self.store.get_position(table, self.direction).await? {
                Some(stored) => stored.position(),
                None => self.initial_position.clone(),
            };
            floor = Some(match floor {
                Some(current) if current <= position => current,
                _ => position,
            });
        }
        Ok(floor.unwrap_or_else(|| self.initial_position.clone()))
    }

    async fn connect_and_stream(&mut self) -> Result<()> {
        let opts = self.replication_opts();
        let endpoint = self.source.endpoint();

        // Side connection for catalog queries.
        let mut side = Conn::new(opts.clone())
            .await
            .map_err(|e| SyncError::connect(&endpoint, e.to_string()))?;

        let resume = self.resume_position().await?;

        // A resume file missing from the source's index is unrecoverable.
        let known_files: Vec<String> = side
            .query_map("SHOW BINARY LOGS", |row: mysql_async::Row| {
                row.get::<String, _>(0).unwrap_or_default()
            })
            .await
            .map_err(|e| SyncError::stream("show_binary_logs", e))?;
        if !known_files.iter().any(|f| f == &resume.file) {
            return Err(SyncError::PositionInvalid {
                file: resume.file.clone(),
            });
        }

        self.load_columns(&mut side).await?;
        drop(side);

        let conn = Conn::new(opts)
            .await
            .map_err(|e| SyncError::connect(&endpoint, e.to_string()))?;

        info!(
            direction = %self.direction,
            server_id = self.server_id,
            position = %resume,
            "Opening binlog stream"
        );

        let request = BinlogStreamRequest::new(self.server_id)
            .with_filename(resume.file.as_bytes())
            .with_pos(resume.offset);
        let mut stream = conn.get_binlog_stream(request).await.map_err(|e| {
            if is_purged_error(&e) {
                SyncError::PositionInvalid {
                    file: resume.file.clone(),
                }
            } else {
                SyncError::connect(&endpoint, e.to_string())
            }
        })?;

        self.set_state(ListenerState::Streaming);
        self.mark_healthy();
        let mut current_file = resume.file.clone();
        let mut shutdown = self.shutdown.clone();

        loop {
            let event = tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    // A closed channel means the run owner is gone.
                    if changed.is_err() || *shutdown.borrow() {
                        info!(direction = %self.direction, "Shutdown signal received during read");
                        return Ok(());
                    }
                    continue;
                }

                event = stream.next() => event,
            };

            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    if is_purged_error(&e) {
                        return Err(SyncError::PositionInvalid { file: current_file });
                    }
                    return Err(SyncError::stream("read_event", e));
                }
                // The source closed the stream cleanly.
                None => return Ok(()),
            };

            self.mark_healthy();
            let log_pos = u64::from(event.header().log_pos());
            let timestamp = event.header().timestamp();

            let data = match event.read_data() {
                Ok(Some(data)) => data,
                // Unknown or ignorable event types.
                Ok(None) => continue,
                Err(e) => {
                    warn!(direction = %self.direction, error = %e, "Undecodable event, skipping");
                    continue;
                }
            };

            match data {
                EventData::RotateEvent(rotate) => {
                    current_file = rotate.name().into_owned();
                    debug!(direction = %self.direction, file = %current_file, "Binlog rotated");
                }
                EventData::RowsEvent(rows_event) => {
                    let tme = match stream.get_tme(rows_event.table_id()) {
                        Some(tme) => tme,
                        None => {
                            warn!(
                                direction = %self.direction,
                                table_id = rows_event.table_id(),
                                "Rows event without table map, skipping"
                            );
                            continue;
                        }
                    };
                    let schema = tme.database_name().into_owned();
                    let table = tme.table_name().into_owned();
                    if !self.is_allowed(&schema, &table) {
                        continue;
                    }
                    let columns = match self.columns.get(&table) {
                        Some(columns) => columns,
                        None => {
                            warn!(table = %table, "No cached column layout, skipping event");
                            continue;
                        }
                    };

                    let kind = match &rows_event {
                        mysql_async::binlog::events::RowsEventData::WriteRowsEvent(_)
                        | mysql_async::binlog::events::RowsEventData::WriteRowsEventV1(_) => {
                            ChangeKind::Insert
                        }
                        mysql_async::binlog::events::RowsEventData::UpdateRowsEvent(_)
                        | mysql_async::binlog::events::RowsEventData::UpdateRowsEventV1(_)
                        | mysql_async::binlog::events::RowsEventData::PartialUpdateRowsEvent(_) => {
                            ChangeKind::Update
                        }
                        mysql_async::binlog::events::RowsEventData::DeleteRowsEvent(_)
                        | mysql_async::binlog::events::RowsEventData::DeleteRowsEventV1(_) => {
                            ChangeKind::Delete
                        }
                        _ => continue,
                    };

                    let mut rows = Vec::new();
                    let mut before_rows = Vec::new();
                    for row in rows_event.rows(tme) {
                        let (before, after) = match row {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(table = %table, error = %e, "Undecodable row, skipping");
                                metrics::record_rows_skipped(&table, 1);
                                continue;
                            }
                        };
                        match kind {
                            ChangeKind::Insert => {
                                if let Some(after) = after {
                                    rows.push(binlog_row_to_image(&after, columns));
                                }
                            }
                            ChangeKind::Delete => {
                                if let Some(before) = before {
                                    rows.push(binlog_row_to_image(&before, columns));
                                }
                            }
                            ChangeKind::Update => {
                                if let (Some(before), Some(after)) = (before, after) {
                                    before_rows.push(binlog_row_to_image(&before, columns));
                                    rows.push(binlog_row_to_image(&after, columns));
                                }
                            }
                        }
                    }

                    if rows.is_empty() {
                        continue;
                    }

                    let change = RowChange {
                        kind,
                        schema,
                        table,
                        rows,
                        before_rows,
                        source_timestamp: timestamp,
                        position: BinlogPosition::new(current_file.clone(), log_pos),
                    };
                    metrics::record_events_read(self.direction.as_str(), 1);

                    match self.sender.send(change, &self.shutdown).await {
                        Ok(()) => {}
                        Err(SyncError::Shutdown) => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
                // Table maps are tracked by the stream; schema changes,
                // transaction markers and heartbeats are not forwarded.
                _ => {}
            }
        }
    }

    /// Load ordered column names for every allow-listed table.
    async fn load_columns(&mut self, conn: &mut Conn) -> Result<()> {
        for table in self.tables.clone() {
            let columns: Vec<String> = conn
                .exec_map(
                    "SELECT COLUMN_NAME FROM information_schema.columns \
                     WHERE table_schema = ? AND table_name = ? ORDER BY ORDINAL_POSITION",
                    (&self.source.database, &table),
                    |name: String| name,
                )
                .await
                .map_err(|e| SyncError::stream("load_columns", e))?;
            if columns.is_empty() {
                return Err(SyncError::schema_mismatch(
                    &table,
                    "table not found on source",
                ));
            }
            debug!(table = %table, columns = columns.len(), "Cached column layout");
            self.columns.insert(table, columns);
        }
        Ok(())
    }
}

/// Convert one decoded binlog row to a column → value image.
///
/// Rows narrower than the cached layout (binlog_row_image=MINIMAL or a
/// schema drift) fill the missing columns with NULL; the applier's
/// data-shape handling decides what to do with them.
fn binlog_row_to_image(row: &BinlogRow, columns: &[String]) -> RowImage {
    let mut image = RowImage::new();
    for (i, column) in columns.iter().enumerate() {
        let value = row
            .as_ref(i)
            .map(binlog_value_to_json)
            .unwrap_or(serde_json::Value::Null);
        image.insert(column.clone(), value);
    }
    image
}

/// Convert one binlog value to JSON.
fn binlog_value_to_json(value: &BinlogValue<'_>) -> serde_json::Value {
    match value {
        BinlogValue::Value(v) => mysql_value_to_json(v),
        // JSON columns arrive as binary jsonb; not decoded here.
        _ => serde_json::Value::Null,
    }
}

/// Convert a driver value to JSON.
fn mysql_value_to_json(value: &mysql_async::Value) -> serde_json::Value {
    use mysql_async::Value;
    match value {
        Value::NULL => serde_json::Value::Null,
        Value::Bytes(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        Value::Int(i) => serde_json::Value::from(*i),
        Value::UInt(u) => serde_json::Value::from(*u),
        Value::Float(f) => serde_json::Value::from(*f as f64),
        Value::Double(d) => serde_json::Value::from(*d),
        Value::Date(year, month, day, hour, minute, second, micro) => {
            let text = if *micro > 0 {
                format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                    year, month, day, hour, minute, second, micro
                )
            } else {
                format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, minute, second
                )
            };
            serde_json::Value::String(text)
        }
        Value::Time(negative, days, hours, minutes, seconds, micro) => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = u32::from(*days) * 24 + u32::from(*hours);
            let text = if *micro > 0 {
                format!(
                    "{}{:02}:{:02}:{:02}.{:06}",
                    sign, total_hours, minutes, seconds, micro
                )
            } else {
                format!("{}{:02}:{:02}:{:02}", sign, total_hours, minutes, seconds)
            };
            serde_json::Value::String(text)
        }
    }
}

/// Current tail of the source binlog (`SHOW MASTER STATUS`).
///
/// Used by the manager when a table has no stored position yet.
pub async fn source_tail(source: &DatabaseConnection) -> Result<BinlogPosition> {
    let opts: Opts = OptsBuilder::default()
        .ip_or_hostname(source.host.clone())
        .tcp_port(source.port)
        .user(Some(source.replication_user.clone()))
        .pass(Some(source.replication_password.clone()))
        .into();
    let mut conn = Conn::new(opts)
        .await
        .map_err(|e| SyncError::connect(source.endpoint(), e.to_string()))?;

    let row: Option<mysql_async::Row> = conn
        .query_first("SHOW MASTER STATUS")
        .await
        .map_err(|e| SyncError::stream("show_master_status", e))?;

    let row = row.ok_or_else(|| {
        SyncError::connect(
            source.endpoint(),
            "binary logging is not enabled on the source",
        )
    })?;
    let file: String = row.get(0).unwrap_or_default();
    let offset: u64 = row.get(1).unwrap_or(4);
    Ok(BinlogPosition::new(file, offset))
}
