// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Worker pool: consumes row changes, batches them per table, and applies
//! them transactionally at the destination.
//!
//! # Partitioning
//!
//! A router task drains the change queue and forwards every event to the
//! worker owning its table (stable hash of `table_name` modulo worker
//! count). Each table is therefore applied by exactly one worker, which
//! preserves intra-table log order with no cross-worker coordination.
//!
//! # Batching
//!
//! A worker buffers incoming events and flushes when (i) the buffer reaches
//! the row cap, (ii) the 500ms flush timer fires with a non-empty buffer,
//! (iii) the input stream terminates, or (iv) cancellation fires. A flush
//! partitions the buffer by table and emits one destination transaction per
//! table, in log order.
//!
//! # Position Advance
//!
//! The position upsert happens *after* the payload commit (the state store
//! may live elsewhere). A crash between the two re-delivers the batch on
//! restart; idempotent DML makes the replay a no-op.
//!
//! # Error Classification
//!
//! - Transient destination errors: bounded retry with backoff, then the run
//!   escalates to `failed`.
//! - Data-shape errors: the row is skipped and counted; more than
//!   [`QUARANTINE_THRESHOLD`] in [`QUARANTINE_WINDOW`] quarantines the
//!   table (no further applies, no position advance) and surfaces
//!   `table_degraded`.
//! - State-store failures: the position simply stays behind (replay-safe);
//!   three consecutive failures escalate to `failed`.

use crate::config::{PrioritySide, SyncDirection, TableConfig};
use crate::conflict::{AppliedMark, ConflictEngine, RecentApplies, StrategyOutcome};
use crate::destination::{Destination, RowOp, TableBatch};
use crate::error::{Result, SyncError};
use crate::event::{ChangeKind, RowChange, RowImage};
use crate::metrics;
use crate::queue::ChangeReceiver;
use crate::resilience::RetryConfig;
use crate::store::{ConflictRecord, StateStore, TablePosition, TableStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Data-shape errors tolerated per table within [`QUARANTINE_WINDOW`].
pub const QUARANTINE_THRESHOLD: usize = 5;
/// Sliding window for the quarantine counter.
pub const QUARANTINE_WINDOW: Duration = Duration::from_secs(60);
/// Deadline for one state-store write.
pub const STORE_WRITE_DEADLINE: Duration = Duration::from_secs(5);
/// Consecutive state-store failures before the run escalates.
pub const STORE_FAILURE_LIMIT: u32 = 3;

/// Tunables for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of applier workers.
    pub workers: usize,
    /// Row cap per batch before a flush is forced.
    pub batch_rows: usize,
    /// Time cap: a non-empty buffer flushes at least this often.
    pub flush_interval: Duration,
    /// Bounded drain on stop; past this the batch is abandoned unapplied.
    pub drain_deadline: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            batch_rows: 1000,
            flush_interval: Duration::from_millis(500),
            drain_deadline: Duration::from_secs(5),
        }
    }
}

impl WorkerPoolConfig {
    /// Small and fast for tests.
    pub fn testing() -> Self {
        Self {
            workers: 2,
            batch_rows: 4,
            flush_interval: Duration::from_millis(20),
            drain_deadline: Duration::from_secs(1),
        }
    }
}

/// Counters accumulated into the run record.
#[derive(Debug, Default)]
pub struct RunTotals {
    rows_applied: AtomicU64,
    conflicts_detected: AtomicU64,
}

impl RunTotals {
    pub fn rows_applied(&self) -> u64 {
        self.rows_applied.load(Ordering::Relaxed)
    }

    pub fn conflicts_detected(&self) -> u64 {
        self.conflicts_detected.load(Ordering::Relaxed)
    }

    fn add_rows(&self, n: u64) {
        self.rows_applied.fetch_add(n, Ordering::Relaxed);
    }

    fn add_conflict(&self) {
        self.conflicts_detected.fetch_add(1, Ordering::Relaxed);
    }
}

/// Stable worker assignment for a table.
fn worker_for(table: &str, workers: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    table.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Everything a pool run shares across its workers.
struct PoolShared {
    direction: SyncDirection,
    tables: HashMap<String, TableConfig>,
    destination: Arc<dyn Destination>,
    store: Arc<dyn StateStore>,
    engine: ConflictEngine,
    recent: Arc<RecentApplies>,
    bidirectional: bool,
    totals: Arc<RunTotals>,
    degraded: Arc<std::sync::Mutex<HashSet<String>>>,
    retry: RetryConfig,
}

/// Applier worker pool for one direction.
pub struct WorkerPool {
    router: tokio::task::JoinHandle<()>,
    workers: Vec<tokio::task::JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Spawn the router and `config.workers` applier workers.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: WorkerPoolConfig,
        tables: Vec<TableConfig>,
        direction: SyncDirection,
        destination: Arc<dyn Destination>,
        store: Arc<dyn StateStore>,
        recent: Arc<RecentApplies>,
        bidirectional: bool,
        mut receiver: ChangeReceiver,
        shutdown: watch::Receiver<bool>,
        totals: Arc<RunTotals>,
        degraded: Arc<std::sync::Mutex<HashSet<String>>>,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            direction,
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            destination,
            store,
            engine: ConflictEngine::new(),
            recent,
            bidirectional,
            totals,
            degraded,
            retry: RetryConfig::destination(),
        });

        // Per-worker bounded queues; capacity one batch each keeps pool
        // memory at queue_capacity + workers × batch_rows.
        let worker_count = config.workers.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let (tx, rx) = mpsc::channel::<RowChange>(config.batch_rows.max(1));
            senders.push(tx);
            let worker = Worker {
                config: config.clone(),
                shared: Arc::clone(&shared),
                shutdown: shutdown.clone(),
            };
            let span = info_span!("applier", worker = id, direction = %shared.direction);
            workers.push(tokio::spawn(worker.run(rx).instrument(span)));
        }

        // Router: single consumer of the change queue, fans out by table
        // hash. Blocking on a full worker queue is the backpressure path.
        let mut router_shutdown = shutdown;
        let router = tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    biased;
                    changed = router_shutdown.changed() => {
                        if changed.is_err() || *router_shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    change = receiver.recv() => change,
                };
                let Some(change) = change else { break };
                let idx = worker_for(&change.table, worker_count);
                if senders[idx].send(change).await.is_err() {
                    break;
                }
            }
            // Dropping the senders lets workers drain and finish.
        });

        Self { router, workers }
    }

    /// Wait for the pool to finish. Returns the first worker error, which
    /// is the signal the manager uses to fail the run.
    pub async fn join(self) -> Result<()> {
        let _ = self.router.await;
        let mut first_error = None;
        for handle in self.workers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_error) => {
                    if first_error.is_none() {
                        first_error =
                            Some(SyncError::Internal(format!("worker panicked: {}", join_error)));
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct Worker {
    config: WorkerPoolConfig,
    shared: Arc<PoolShared>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<RowChange>) -> Result<()> {
        debug!("Applier worker started");
        let mut shutdown = self.shutdown.clone();
        let mut state = WorkerState::new();
        let mut buffer: Vec<RowChange> = Vec::new();
        let mut buffered_rows = 0usize;
        let mut timer = tokio::time::interval(self.config.flush_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break self.drain(&mut state, &mut buffer).await;
                    }
                }

                _ = timer.tick() => {
                    if !buffer.is_empty() {
                        if let Err(e) = self.flush(&mut state, &mut buffer).await {
                            break Err(e);
                        }
                        buffered_rows = 0;
                    }
                }

                change = rx.recv() => {
                    match change {
                        Some(change) => {
                            buffered_rows += change.row_count();
                            buffer.push(change);
                            if buffered_rows >= self.config.batch_rows {
                                if let Err(e) = self.flush(&mut state, &mut buffer).await {
                                    break Err(e);
                                }
                                buffered_rows = 0;
                            }
                        }
                        // Input stream terminated: final flush, then exit.
                        None => break self.flush(&mut state, &mut buffer).await,
                    }
                }
            }
        };

        if let Err(ref e) = result {
            error!(error = %e, "Applier worker exiting with error");
        } else {
            debug!("Applier worker stopped");
        }
        result
    }

    /// Bounded flush on cancellation. Past the deadline the batch is
    /// abandoned without advancing any position.
    async fn drain(&self, state: &mut WorkerState, buffer: &mut Vec<RowChange>) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        info!(pending = buffer.len(), "Draining buffer before shutdown");
        match tokio::time::timeout(self.config.drain_deadline, self.flush(state, buffer)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    deadline_ms = self.config.drain_deadline.as_millis() as u64,
                    "Drain deadline exceeded, abandoning batch (position not advanced)"
                );
                Ok(())
            }
        }
    }

    /// Flush the buffer: one transaction per table, in log order.
    async fn flush(&self, state: &mut WorkerState, buffer: &mut Vec<RowChange>) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let changes = std::mem::take(buffer);

        // Partition by table, preserving first-seen order.
        let mut order: Vec<String> = Vec::new();
        let mut by_table: HashMap<String, Vec<RowChange>> = HashMap::new();
        for change in changes {
            if !by_table.contains_key(&change.table) {
                order.push(change.table.clone());
            }
            by_table.entry(change.table.clone()).or_default().push(change);
        }

        for table in order {
            let events = by_table.remove(&table).unwrap_or_default();
            if state.quarantined.contains(&table) {
                warn!(table = %table, dropped = events.len(), "Table quarantined, dropping events");
                continue;
            }
            let Some(table_config) = self.shared.tables.get(&table).cloned() else {
                // Allow-list and config disagree; treat as data shape.
                warn!(table = %table, "No table config, dropping events");
                continue;
            };
            self.apply_table(state, &table_config, events).await?;
        }
        Ok(())
    }

    async fn apply_table(
        &self,
        state: &mut WorkerState,
        table: &TableConfig,
        events: Vec<RowChange>,
    ) -> Result<()> {
        let started = Instant::now();
        let Some(max_position) = events.iter().map(|e| e.position.clone()).max() else {
            return Ok(());
        };
        let last_source_timestamp = events.last().map(|e| e.source_timestamp).unwrap_or(0);

        let (ops, marks) = self.build_ops(state, table, &events).await?;
        if state.quarantined.contains(&table.name) {
            return Ok(());
        }
        if ops.is_empty() {
            // Everything was skipped or conflicted away; nothing committed,
            // so the position must not move either.
            return Ok(());
        }

        // The per-table batch_size override caps one transaction; chunks
        // commit in order, so a crash mid-table replays only a suffix.
        let chunk_size = table.batch_size.unwrap_or(usize::MAX).max(1);
        let total_ops = ops.len();
        let mut applied = 0u64;
        for chunk in ops.chunks(chunk_size) {
            let batch = TableBatch {
                table: table.name.clone(),
                pk_column: table.primary_key.clone(),
                ops: chunk.to_vec(),
                max_position: max_position.clone(),
                last_source_timestamp,
            };
            applied += self.apply_with_retry(&batch).await?;
        }
        metrics::record_rows_applied(&table.name, applied);
        metrics::record_batch_flush(&table.name, total_ops, started.elapsed());
        self.shared.totals.add_rows(applied);

        for (pk, position) in marks {
            self.shared.recent.note(
                &table.name,
                &pk,
                AppliedMark {
                    position,
                    direction: self.shared.direction,
                    source_timestamp: last_source_timestamp,
                },
            );
        }

        self.advance_position(state, table, &max_position, last_source_timestamp, applied)
            .await
    }

    /// Apply with bounded retry on transient errors.
    async fn apply_with_retry(&self, batch: &TableBatch) -> Result<u64> {
        let mut attempt = 0usize;
        loop {
            match self.shared.destination.apply(batch).await {
                Ok(applied) => return Ok(applied),
                Err(e) if e.is_retryable() && attempt + 1 < self.shared.retry.max_attempts => {
                    attempt += 1;
                    let delay = self.shared.retry.delay_for_attempt(attempt);
                    warn!(
                        table = %batch.table,
                        error = %e,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "Destination apply failed, retrying"
                    );
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = shutdown.changed() => return Err(SyncError::Shutdown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Translate events into row operations, running the conflict hook.
    ///
    /// Returns the ops plus the `(pk, position)` marks to record in the
    /// recent-applies cache after the batch commits.
    async fn build_ops(
        &self,
        state: &mut WorkerState,
        table: &TableConfig,
        events: &[RowChange],
    ) -> Result<(Vec<RowOp>, Vec<(String, crate::event::BinlogPosition)>)> {
        let mut ops = Vec::new();
        let mut marks = Vec::new();

        for event in events {
            for (i, image) in event.rows.iter().enumerate() {
                let Some(pk) = RowChange::primary_key_of(image, &table.primary_key) else {
                    self.record_shape_error(
                        state,
                        table,
                        &format!("row image missing primary key {}", table.primary_key),
                    );
                    if state.quarantined.contains(&table.name) {
                        return Ok((Vec::new(), Vec::new()));
                    }
                    continue;
                };
                let pk_value = image
                    .get(&table.primary_key)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);

                // Bidirectional hook: a recent opposite-direction apply for
                // this key means the two sides may have diverged.
                if self.shared.bidirectional
                    && event.kind != ChangeKind::Insert
                    && self
                        .shared
                        .recent
                        .opposite_of(&table.name, &pk, self.shared.direction)
                        .is_some()
                {
                    match self
                        .check_conflict(table, event.kind, image, &pk, &pk_value)
                        .await?
                    {
                        ConflictAction::Proceed => {}
                        ConflictAction::Skip => continue,
                        ConflictAction::DeleteWins => {
                            ops.push(RowOp::Delete {
                                pk: pk_value.clone(),
                            });
                            marks.push((pk, event.position.clone()));
                            continue;
                        }
                    }
                }

                match event.kind {
                    ChangeKind::Insert => ops.push(RowOp::Upsert {
                        image: image.clone(),
                    }),
                    ChangeKind::Update => {
                        let where_pk = event
                            .before_rows
                            .get(i)
                            .and_then(|before| before.get(&table.primary_key))
                            .cloned()
                            .unwrap_or_else(|| pk_value.clone());
                        ops.push(RowOp::Update {
                            image: image.clone(),
                            where_pk,
                        });
                    }
                    ChangeKind::Delete => ops.push(RowOp::Delete {
                        pk: pk_value.clone(),
                    }),
                }
                marks.push((pk, event.position.clone()));
            }
        }

        Ok((ops, marks))
    }

    /// Run detection and the table's strategy for one incoming row.
    async fn check_conflict(
        &self,
        table: &TableConfig,
        kind: ChangeKind,
        incoming: &RowImage,
        pk: &str,
        pk_value: &serde_json::Value,
    ) -> Result<ConflictAction> {
        let current = self
            .shared
            .destination
            .fetch_row(&table.name, &table.primary_key, pk_value)
            .await?;

        // Which side each image belongs to depends on our direction.
        let incoming_side = match self.shared.direction {
            SyncDirection::LocalToCloud => PrioritySide::Local,
            SyncDirection::CloudToLocal => PrioritySide::Cloud,
        };
        let (incoming_image, current_image) = match kind {
            ChangeKind::Delete => (None, current.as_ref()),
            _ => (Some(incoming), current.as_ref()),
        };
        let (local, cloud) = match incoming_side {
            PrioritySide::Local => (incoming_image, current_image),
            PrioritySide::Cloud => (current_image, incoming_image),
        };

        let Some(kind_detected) = self.shared.engine.detect(table, local, cloud, kind) else {
            return Ok(ConflictAction::Proceed);
        };

        metrics::record_conflict(&table.name, kind_detected.as_str());
        self.shared.totals.add_conflict();

        let outcome = self.shared.engine.resolve(table, local, cloud);
        let mut record = ConflictRecord::new(
            &table.name,
            pk,
            local.cloned().unwrap_or_default(),
            cloud.cloned().unwrap_or_default(),
            kind_detected,
        );

        match outcome {
            StrategyOutcome::Resolved {
                winner,
                strategy,
                winning_side,
            } => {
                record.resolved = true;
                record.resolution_strategy = Some(strategy);
                record.resolved_at = Some(chrono::Utc::now());
                record.resolved_image = winner.clone();
                match self.shared.store.create_conflict(&record).await {
                    Ok(()) => {}
                    // A pending manual conflict takes precedence.
                    Err(SyncError::ConflictExists { .. }) => return Ok(ConflictAction::Skip),
                    Err(e) => return Err(e),
                }
                metrics::record_conflict_resolved(&table.name, strategy.as_str());
                info!(
                    table = %table.name,
                    pk = %pk,
                    kind = %kind_detected,
                    strategy = strategy.as_str(),
                    winner = ?winning_side,
                    "Conflict resolved"
                );

                if winning_side == incoming_side {
                    if winner.is_none() {
                        // Our side deleted the row and that deletion won.
                        Ok(ConflictAction::DeleteWins)
                    } else {
                        Ok(ConflictAction::Proceed)
                    }
                } else {
                    // The destination's row stands; the reverse stream will
                    // carry it back to the losing side.
                    Ok(ConflictAction::Skip)
                }
            }
            StrategyOutcome::Unresolved => {
                match self.shared.store.create_conflict(&record).await {
                    Ok(()) => {
                        info!(
                            table = %table.name,
                            pk = %pk,
                            kind = %kind_detected,
                            "Conflict recorded for manual resolution"
                        );
                    }
                    Err(SyncError::ConflictExists { .. }) => {
                        debug!(table = %table.name, pk = %pk, "Conflict already pending");
                    }
                    Err(e) => return Err(e),
                }
                Ok(ConflictAction::Skip)
            }
        }
    }

    /// Count a data-shape error; quarantine the table past the threshold.
    fn record_shape_error(&self, state: &mut WorkerState, table: &TableConfig, detail: &str) {
        warn!(table = %table.name, detail, "Data shape error, skipping row");
        metrics::record_rows_skipped(&table.name, 1);

        let now = Instant::now();
        let window = state.shape_errors.entry(table.name.clone()).or_default();
        window.push_back(now);
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > QUARANTINE_WINDOW)
        {
            window.pop_front();
        }
        if window.len() >= QUARANTINE_THRESHOLD {
            error!(table = %table.name, "table_degraded: error threshold exceeded, quarantining");
            state.quarantined.insert(table.name.clone());
            metrics::set_table_quarantined(&table.name, true);
            self.shared
                .degraded
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(table.name.clone());
        }
    }

    /// Advance the durable position after a successful commit.
    async fn advance_position(
        &self,
        state: &mut WorkerState,
        table: &TableConfig,
        position: &crate::event::BinlogPosition,
        source_timestamp: u32,
        applied: u64,
    ) -> Result<()> {
        let previous_rows = match state.rows_applied.get(&table.name) {
            Some(rows) => *rows,
            None => {
                // First touch: continue this direction's own counter.
                let stored = self
                    .shared
                    .store
                    .get_position(&table.name, self.shared.direction)
                    .await
                    .ok()
                    .flatten();
                stored.map(|p| p.rows_applied).unwrap_or(0)
            }
        };
        let total_rows = previous_rows + applied;

        let record = TablePosition {
            table_name: table.name.clone(),
            last_file: position.file.clone(),
            last_offset: position.offset,
            last_source_timestamp: i64::from(source_timestamp),
            rows_applied: total_rows,
            direction: self.shared.direction,
            status: TableStatus::Running,
            error_message: None,
            updated_at: chrono::Utc::now(),
        };

        let write = self.shared.store.upsert_position(&record);
        match tokio::time::timeout(STORE_WRITE_DEADLINE, write).await {
            Ok(Ok(())) => {
                state.rows_applied.insert(table.name.clone(), total_rows);
                state.store_failures = 0;
                metrics::record_position_advance(&table.name);
                debug!(table = %table.name, position = %position, "Position advanced");
                Ok(())
            }
            Ok(Err(e)) => self.count_store_failure(state, e),
            Err(_) => self.count_store_failure(
                state,
                SyncError::Timeout {
                    operation: "upsert_position".to_string(),
                    seconds: STORE_WRITE_DEADLINE.as_secs(),
                },
            ),
        }
    }

    /// A stale position is replay-safe; only repeated failures escalate.
    fn count_store_failure(&self, state: &mut WorkerState, e: SyncError) -> Result<()> {
        state.store_failures += 1;
        warn!(
            error = %e,
            consecutive = state.store_failures,
            "State store write failed, position not advanced"
        );
        if state.store_failures >= STORE_FAILURE_LIMIT {
            return Err(e);
        }
        Ok(())
    }
}

/// What the conflict hook decided for one row.
#[derive(Debug, PartialEq, Eq)]
enum ConflictAction {
    Proceed,
    Skip,
    DeleteWins,
}

/// Per-worker mutable state.
struct WorkerState {
    /// Data-shape error timestamps per table (sliding window).
    shape_errors: HashMap<String, VecDeque<Instant>>,
    quarantined: HashSet<String>,
    /// Cached rows_applied counters per table.
    rows_applied: HashMap<String, u64>,
    store_failures: u32,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            shape_errors: HashMap::new(),
            quarantined: HashSet::new(),
            rows_applied: HashMap::new(),
            store_failures: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::MemoryDestination;
    use crate::event::BinlogPosition;
    use crate::queue::change_queue;
    use crate::store::SqliteStateStore;
    use serde_json::json;

    fn image(pairs: &[(&str, serde_json::Value)]) -> RowImage {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn insert(table: &str, offset: u64, img: RowImage) -> RowChange {
        RowChange {
            kind: ChangeKind::Insert,
            schema: "app".to_string(),
            table: table.to_string(),
            rows: vec![img],
            before_rows: vec![],
            source_timestamp: 1_700_000_000,
            position: BinlogPosition::new("mysql-bin.000001", offset),
        }
    }

    fn update(table: &str, offset: u64, before: RowImage, after: RowImage) -> RowChange {
        RowChange {
            kind: ChangeKind::Update,
            schema: "app".to_string(),
            table: table.to_string(),
            rows: vec![after],
            before_rows: vec![before],
            source_timestamp: 1_700_000_000,
            position: BinlogPosition::new("mysql-bin.000001", offset),
        }
    }

    struct Harness {
        destination: Arc<MemoryDestination>,
        store: Arc<SqliteStateStore>,
        recent: Arc<RecentApplies>,
        totals: Arc<RunTotals>,
        degraded: Arc<std::sync::Mutex<HashSet<String>>>,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    impl Harness {
        async fn new() -> Self {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            Self {
                destination: Arc::new(MemoryDestination::new()),
                store: Arc::new(SqliteStateStore::open(":memory:").await.unwrap()),
                recent: Arc::new(RecentApplies::default()),
                totals: Arc::new(RunTotals::default()),
                degraded: Arc::new(std::sync::Mutex::new(HashSet::new())),
                shutdown_tx,
                shutdown_rx,
            }
        }

        fn spawn(
            &self,
            tables: Vec<TableConfig>,
            bidirectional: bool,
            receiver: ChangeReceiver,
        ) -> WorkerPool {
            WorkerPool::spawn(
                WorkerPoolConfig::testing(),
                tables,
                SyncDirection::LocalToCloud,
                Arc::clone(&self.destination) as Arc<dyn Destination>,
                Arc::clone(&self.store) as Arc<dyn StateStore>,
                Arc::clone(&self.recent),
                bidirectional,
                receiver,
                self.shutdown_rx.clone(),
                Arc::clone(&self.totals),
                Arc::clone(&self.degraded),
            )
        }
    }

    #[test]
    fn test_worker_for_is_stable_and_in_range() {
        for workers in [1, 2, 8] {
            for table in ["users", "orders", "items"] {
                let first = worker_for(table, workers);
                assert_eq!(first, worker_for(table, workers));
                assert!(first < workers);
            }
        }
    }

    #[tokio::test]
    async fn test_insert_applied_and_position_advanced() {
        let harness = Harness::new().await;
        let (tx, rx) = change_queue(64);
        let pool = harness.spawn(vec![TableConfig::for_testing("users")], false, rx);

        tx.send(
            insert("users", 42, image(&[("id", json!(1)), ("name", json!("A"))])),
            &harness.shutdown_rx,
        )
        .await
        .unwrap();
        drop(tx);
        pool.join().await.unwrap();

        let row = harness.destination.get("users", "1").unwrap();
        assert_eq!(row.get("name"), Some(&json!("A")));

        let position = harness.store.get_position("users", SyncDirection::LocalToCloud).await.unwrap().unwrap();
        assert_eq!(position.last_offset, 42);
        assert_eq!(position.rows_applied, 1);
        assert_eq!(harness.totals.rows_applied(), 1);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let harness = Harness::new().await;
        let (tx, rx) = change_queue(64);
        let pool = harness.spawn(vec![TableConfig::for_testing("users")], false, rx);

        let event = insert("users", 42, image(&[("id", json!(1)), ("name", json!("A"))]));
        tx.send(event.clone(), &harness.shutdown_rx).await.unwrap();
        tx.send(event, &harness.shutdown_rx).await.unwrap();
        drop(tx);
        pool.join().await.unwrap();

        assert_eq!(harness.destination.row_count("users"), 1);
        let position = harness.store.get_position("users", SyncDirection::LocalToCloud).await.unwrap().unwrap();
        assert_eq!(position.last_offset, 42);
    }

    #[tokio::test]
    async fn test_intra_table_order_preserved() {
        let harness = Harness::new().await;
        let (tx, rx) = change_queue(64);
        let pool = harness.spawn(vec![TableConfig::for_testing("users")], false, rx);

        tx.send(
            insert("users", 10, image(&[("id", json!(1)), ("name", json!("v1"))])),
            &harness.shutdown_rx,
        )
        .await
        .unwrap();
        for (offset, name) in [(20, "v2"), (30, "v3"), (40, "v4")] {
            tx.send(
                update(
                    "users",
                    offset,
                    image(&[("id", json!(1)), ("name", json!("old"))]),
                    image(&[("id", json!(1)), ("name", json!(name))]),
                ),
                &harness.shutdown_rx,
            )
            .await
            .unwrap();
        }
        drop(tx);
        pool.join().await.unwrap();

        let row = harness.destination.get("users", "1").unwrap();
        assert_eq!(row.get("name"), Some(&json!("v4")));
        let position = harness.store.get_position("users", SyncDirection::LocalToCloud).await.unwrap().unwrap();
        assert_eq!(position.last_offset, 40);
    }

    #[tokio::test]
    async fn test_update_without_match_inserts() {
        let harness = Harness::new().await;
        let (tx, rx) = change_queue(64);
        let pool = harness.spawn(vec![TableConfig::for_testing("users")], false, rx);

        tx.send(
            update(
                "users",
                10,
                image(&[("id", json!(9)), ("name", json!("old"))]),
                image(&[("id", json!(9)), ("name", json!("new"))]),
            ),
            &harness.shutdown_rx,
        )
        .await
        .unwrap();
        drop(tx);
        pool.join().await.unwrap();

        let row = harness.destination.get("users", "9").unwrap();
        assert_eq!(row.get("name"), Some(&json!("new")));
    }

    #[tokio::test]
    async fn test_transient_destination_failure_retried() {
        let harness = Harness::new().await;
        harness.destination.fail_next(2);
        let (tx, rx) = change_queue(64);
        let pool = harness.spawn(vec![TableConfig::for_testing("users")], false, rx);

        tx.send(
            insert("users", 5, image(&[("id", json!(1)), ("name", json!("A"))])),
            &harness.shutdown_rx,
        )
        .await
        .unwrap();
        drop(tx);
        pool.join().await.unwrap();

        assert_eq!(harness.destination.row_count("users"), 1);
        assert_eq!(harness.store.get_position("users", SyncDirection::LocalToCloud).await.unwrap().unwrap().last_offset, 5);
    }

    #[tokio::test]
    async fn test_quarantine_after_shape_errors() {
        let harness = Harness::new().await;
        let (tx, rx) = change_queue(64);
        let pool = harness.spawn(vec![TableConfig::for_testing("users")], false, rx);

        // QUARANTINE_THRESHOLD rows without the primary key.
        for offset in 0..QUARANTINE_THRESHOLD as u64 {
            tx.send(
                insert("users", offset + 1, image(&[("name", json!("no pk"))])),
                &harness.shutdown_rx,
            )
            .await
            .unwrap();
        }
        // A valid row afterwards must be dropped too.
        tx.send(
            insert("users", 99, image(&[("id", json!(1)), ("name", json!("late"))])),
            &harness.shutdown_rx,
        )
        .await
        .unwrap();
        drop(tx);
        pool.join().await.unwrap();

        assert_eq!(harness.destination.row_count("users"), 0);
        assert!(harness.store.get_position("users", SyncDirection::LocalToCloud).await.unwrap().is_none());
        assert!(harness
            .degraded
            .lock()
            .unwrap()
            .contains("users"));
    }

    #[tokio::test]
    async fn test_conflict_lww_incoming_wins() {
        let harness = Harness::new().await;
        // Destination already has the cloud row; the cloud applier noted it.
        harness.destination.seed(
            "users",
            "5",
            image(&[
                ("id", json!(5)),
                ("name", json!("C")),
                ("updated_at", json!("2026-01-01 00:00:00")),
            ]),
        );
        harness.recent.note(
            "users",
            "5",
            AppliedMark {
                position: BinlogPosition::new("mysql-bin.000001", 1),
                direction: SyncDirection::CloudToLocal,
                source_timestamp: 0,
            },
        );

        let (tx, rx) = change_queue(64);
        let pool = harness.spawn(vec![TableConfig::for_testing("users")], true, rx);

        // Local update with the newer timestamp wins.
        tx.send(
            update(
                "users",
                50,
                image(&[("id", json!(5)), ("name", json!("C"))]),
                image(&[
                    ("id", json!(5)),
                    ("name", json!("L")),
                    ("updated_at", json!("2026-01-02 00:00:00")),
                ]),
            ),
            &harness.shutdown_rx,
        )
        .await
        .unwrap();
        drop(tx);
        pool.join().await.unwrap();

        let row = harness.destination.get("users", "5").unwrap();
        assert_eq!(row.get("name"), Some(&json!("L")));

        let conflicts = harness.store.list_conflicts(None, 10, 0).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].resolved);
        assert_eq!(
            conflicts[0].resolution_strategy,
            Some(crate::config::ConflictResolution::LastWriteWins)
        );
        assert_eq!(harness.totals.conflicts_detected(), 1);
    }

    #[tokio::test]
    async fn test_conflict_lww_destination_wins() {
        let harness = Harness::new().await;
        harness.destination.seed(
            "users",
            "5",
            image(&[
                ("id", json!(5)),
                ("name", json!("C")),
                ("updated_at", json!("2026-05-01 00:00:00")),
            ]),
        );
        harness.recent.note(
            "users",
            "5",
            AppliedMark {
                position: BinlogPosition::new("mysql-bin.000001", 1),
                direction: SyncDirection::CloudToLocal,
                source_timestamp: 0,
            },
        );

        let (tx, rx) = change_queue(64);
        let pool = harness.spawn(vec![TableConfig::for_testing("users")], true, rx);

        // Local update is older: destination row must stand.
        tx.send(
            update(
                "users",
                50,
                image(&[("id", json!(5)), ("name", json!("C"))]),
                image(&[
                    ("id", json!(5)),
                    ("name", json!("L")),
                    ("updated_at", json!("2026-01-02 00:00:00")),
                ]),
            ),
            &harness.shutdown_rx,
        )
        .await
        .unwrap();
        drop(tx);
        pool.join().await.unwrap();

        let row = harness.destination.get("users", "5").unwrap();
        assert_eq!(row.get("name"), Some(&json!("C")));
        let conflicts = harness.store.list_conflicts(Some(true), 10, 0).await.unwrap();
        assert_eq!(conflicts.len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_manual_skips_and_records() {
        let harness = Harness::new().await;
        let seeded = image(&[
            ("id", json!(5)),
            ("name", json!("C")),
            ("updated_at", json!("2026-01-01 00:00:00")),
        ]);
        harness.destination.seed("users", "5", seeded.clone());
        harness.recent.note(
            "users",
            "5",
            AppliedMark {
                position: BinlogPosition::new("mysql-bin.000001", 1),
                direction: SyncDirection::CloudToLocal,
                source_timestamp: 0,
            },
        );

        let mut table = TableConfig::for_testing("users");
        table.conflict_resolution = crate::config::ConflictResolution::Manual;

        let (tx, rx) = change_queue(64);
        let pool = harness.spawn(vec![table], true, rx);

        tx.send(
            update(
                "users",
                50,
                image(&[("id", json!(5)), ("name", json!("C"))]),
                image(&[
                    ("id", json!(5)),
                    ("name", json!("L")),
                    ("updated_at", json!("2026-01-02 00:00:00")),
                ]),
            ),
            &harness.shutdown_rx,
        )
        .await
        .unwrap();
        drop(tx);
        pool.join().await.unwrap();

        // Destination row untouched, conflict pending.
        assert_eq!(harness.destination.get("users", "5"), Some(seeded));
        let pending = harness.store.list_conflicts(Some(false), 10, 0).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].resolved);
        // No position advance for a fully-skipped batch.
        assert!(harness.store.get_position("users", SyncDirection::LocalToCloud).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_drains_buffer() {
        let harness = Harness::new().await;
        let (tx, rx) = change_queue(64);
        let pool = harness.spawn(vec![TableConfig::for_testing("users")], false, rx);

        tx.send(
            insert("users", 7, image(&[("id", json!(1)), ("name", json!("A"))])),
            &harness.shutdown_rx,
        )
        .await
        .unwrap();

        // Give the router time to hand the event to a worker, then stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.shutdown_tx.send(true).unwrap();
        pool.join().await.unwrap();

        assert_eq!(harness.destination.row_count("users"), 1);
    }

    #[tokio::test]
    async fn test_tables_partitioned_across_workers_keep_order() {
        let harness = Harness::new().await;
        let (tx, rx) = change_queue(256);
        let tables = vec![
            TableConfig::for_testing("users"),
            TableConfig::for_testing("orders"),
            TableConfig::for_testing("items"),
        ];
        let pool = harness.spawn(tables, false, rx);

        for offset in 1..=30u64 {
            for table in ["users", "orders", "items"] {
                tx.send(
                    insert(
                        table,
                        offset,
                        image(&[("id", json!(1)), ("v", json!(offset))]),
                    ),
                    &harness.shutdown_rx,
                )
                .await
                .unwrap();
            }
        }
        drop(tx);
        pool.join().await.unwrap();

        for table in ["users", "orders", "items"] {
            let row = harness.destination.get(table, "1").unwrap();
            assert_eq!(row.get("v"), Some(&json!(30)), "table {}", table);
            let position = harness.store.get_position(table, SyncDirection::LocalToCloud).await.unwrap().unwrap();
            assert_eq!(position.last_offset, 30);
        }
    }
}
