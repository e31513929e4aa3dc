// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync manager: single owner of a run.
//!
//! The manager enforces mutual exclusion, constructs the pipeline halves
//! (listener + worker pool per direction), wires in resume positions, and
//! finalizes the audit record when the run ends.
//!
//! # State Machine
//!
//! ```text
//!          start()                    (pipeline up)
//! Idle ──────────────→ Starting ─────────────────────→ Running
//!  ↑                      │                               │
//!  │   (config/connect    │                        stop() │
//!  │    error, run        ↓                               ↓
//!  │    finalized)      Failed ←──(unrecoverable error)─ Stopping
//!  │                      │                               │
//!  └──────────────────────┴───────(run finalized)─────────┘
//! ```
//!
//! `Failed` finalizes the `RunRecord` with the error message and
//! auto-transitions back to `Idle`; a new `start()` may then be attempted.
//! The manager is the only component that writes `RunRecord.status`.

use crate::applier::{RunTotals, WorkerPool, WorkerPoolConfig};
use crate::config::{Config, SyncDirection, SyncMode};
use crate::error::{Result, SyncError};
use crate::listener::{source_tail, BinlogListener};
use crate::metrics;
use crate::queue::change_queue;
use crate::conflict::RecentApplies;
use crate::destination::{Destination, MySqlDestination};
use crate::store::{RunRecord, RunStatus, StateStore};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

/// Manager lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Starting => "starting",
            SyncStatus::Running => "running",
            SyncStatus::Stopping => "stopping",
            SyncStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view for the external control surface.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub status: SyncStatus,
    pub mode: SyncMode,
    pub run_id: Option<String>,
    /// Last moment any listener saw healthy stream activity. The external
    /// fallback scheduler should no-op while `status` is `running` and
    /// this is recent.
    pub last_healthy_at: Option<DateTime<Utc>>,
    /// Tables quarantined during this run (`table_degraded`).
    pub degraded_tables: Vec<String>,
    pub rows_applied: u64,
    pub conflicts_detected: u64,
}

struct ActiveRun {
    run_id: String,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Option<tokio::task::JoinHandle<()>>,
    totals: Arc<RunTotals>,
    degraded: Arc<std::sync::Mutex<HashSet<String>>>,
}

/// Single owner of the sync lifecycle.
///
/// Run status and the active-run handle are guarded by one mutex
/// (`current`): every transition that ends a run clears the handle and
/// moves the status inside the same critical section, so observers never
/// see one without the other.
pub struct SyncManager {
    config: Config,
    store: Arc<dyn StateStore>,
    status_tx: watch::Sender<SyncStatus>,
    status_rx: watch::Receiver<SyncStatus>,
    /// Shared with the supervisor task, which clears it when a run ends on
    /// its own (fatal listener error, escalation) rather than via `stop()`.
    current: Arc<Mutex<Option<ActiveRun>>>,
    last_healthy_at: Arc<AtomicI64>,
}

impl SyncManager {
    pub fn new(config: Config, store: Arc<dyn StateStore>) -> Self {
        let (status_tx, status_rx) = watch::channel(SyncStatus::Idle);
        Self {
            config,
            store,
            status_tx,
            status_rx,
            current: Arc::new(Mutex::new(None)),
            last_healthy_at: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SyncStatus {
        *self.status_rx.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Last healthy stream activity across all listeners.
    pub fn last_healthy_at(&self) -> Option<DateTime<Utc>> {
        match self.last_healthy_at.load(Ordering::Relaxed) {
            0 => None,
            secs => DateTime::from_timestamp(secs, 0),
        }
    }

    fn set_status(&self, status: SyncStatus) {
        let _ = self.status_tx.send(status);
        metrics::set_manager_state(&status.to_string());
    }

    /// Snapshot for the external control surface.
    pub async fn snapshot(&self) -> StatusSnapshot {
        let current = self.current.lock().await;
        let (run_id, degraded, rows, conflicts) = match current.as_ref() {
            Some(run) => (
                Some(run.run_id.clone()),
                run.degraded
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                    .cloned()
                    .collect(),
                run.totals.rows_applied(),
                run.totals.conflicts_detected(),
            ),
            None => (None, Vec::new(), 0, 0),
        };
        StatusSnapshot {
            status: self.status(),
            mode: self.config.sync.mode,
            run_id,
            last_healthy_at: self.last_healthy_at(),
            degraded_tables: degraded,
            rows_applied: rows,
            conflicts_detected: conflicts,
        }
    }

    /// Start a run.
    ///
    /// Rejects with [`SyncError::AlreadyRunning`] while a run is active;
    /// invalid configuration keeps the manager in `idle`.
    pub async fn start(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        if self.status() != SyncStatus::Idle {
            return Err(SyncError::AlreadyRunning);
        }
        self.set_status(SyncStatus::Starting);

        if let Err(e) = self.config.validate() {
            warn!(error = %e, "Configuration invalid, staying idle");
            self.set_status(SyncStatus::Idle);
            return Err(e);
        }

        match self.launch().await {
            Ok(run) => {
                info!(run_id = %run.run_id, mode = ?self.config.sync.mode, "Sync running");
                self.set_status(SyncStatus::Running);
                *current = Some(run);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to start sync");
                self.set_status(SyncStatus::Failed);
                self.set_status(SyncStatus::Idle);
                Err(e)
            }
        }
    }

    /// Construct and spawn both pipeline halves.
    async fn launch(&self) -> Result<ActiveRun> {
        let sync = &self.config.sync;
        let tables: Vec<String> = sync.tables.iter().map(|t| t.name.clone()).collect();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let totals = Arc::new(RunTotals::default());
        let degraded = Arc::new(std::sync::Mutex::new(HashSet::new()));
        let recent = Arc::new(RecentApplies::default());
        let bidirectional = sync.mode.is_bidirectional();

        let mut run = RunRecord::begin(mode_name(sync.mode), tables);
        let mut listener_handles = Vec::new();
        let mut pools = Vec::new();

        // Any failure past this point must cancel what was already spawned.
        let built: Result<()> = async {
            for (i, direction) in sync.mode.directions().into_iter().enumerate() {
                let (source, peer) = match direction {
                    SyncDirection::LocalToCloud => {
                        (&self.config.databases.local, &self.config.databases.cloud)
                    }
                    SyncDirection::CloudToLocal => {
                        (&self.config.databases.cloud, &self.config.databases.local)
                    }
                };

                // No stored position yet means "begin from the current tail".
                let initial = source_tail(source).await?;
                let destination: Arc<dyn Destination> =
                    Arc::new(MySqlDestination::connect(&peer.dml_url(), sync.workers).await?);

                let (tx, rx) = change_queue(sync.queue_capacity);
                // Distinct replica id per listener instance.
                let listener = BinlogListener::new(
                    source.clone(),
                    &sync.tables,
                    direction,
                    sync.server_id + i as u32,
                    Arc::clone(&self.store),
                    tx,
                    shutdown_rx.clone(),
                    initial,
                    Arc::clone(&self.last_healthy_at),
                );
                listener_handles.push(tokio::spawn(listener.run()));

                let pool = WorkerPool::spawn(
                    WorkerPoolConfig {
                        workers: sync.workers,
                        batch_rows: sync.batch_insert_size,
                        ..Default::default()
                    },
                    sync.tables.clone(),
                    direction,
                    destination,
                    Arc::clone(&self.store),
                    Arc::clone(&recent),
                    bidirectional,
                    rx,
                    shutdown_rx.clone(),
                    Arc::clone(&totals),
                    Arc::clone(&degraded),
                );
                pools.push(pool);
            }

            self.store.create_run(&run).await
        }
        .await;

        if let Err(e) = built {
            // Tear down whatever half-pipeline got spawned.
            let _ = shutdown_tx.send(true);
            for handle in listener_handles {
                let _ = handle.await;
            }
            for pool in pools {
                let _ = pool.join().await;
            }
            return Err(e);
        }

        // The supervisor waits for both halves, then finalizes the run and
        // returns the manager to idle. It is the only writer of
        // RunRecord.status, and it retires the run handle and the status
        // under the manager's mutex so the two always change together.
        let store = Arc::clone(&self.store);
        let status_tx = self.status_tx.clone();
        let current = Arc::clone(&self.current);
        let totals_for_run = Arc::clone(&totals);
        let run_id = run.id.clone();
        let supervisor = tokio::spawn(async move {
            let mut fatal: Option<SyncError> = None;
            for handle in listener_handles {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        fatal.get_or_insert(e);
                    }
                    Err(join_error) => {
                        fatal.get_or_insert(SyncError::Internal(format!(
                            "listener panicked: {}",
                            join_error
                        )));
                    }
                }
            }
            for pool in pools {
                if let Err(e) = pool.join().await {
                    fatal.get_or_insert(e);
                }
            }

            run.total_rows_applied = totals_for_run.rows_applied();
            run.conflicts_detected = totals_for_run.conflicts_detected();
            run.completed_at = Some(Utc::now());

            // Terminal section: status, run record, and the active-run
            // handle retire in one critical section. `stop()` releases
            // this lock before awaiting us, so there is no deadlock.
            let mut current = current.lock().await;
            match &fatal {
                Some(e) => {
                    error!(run_id = %run.id, error = %e, "Run failed");
                    let _ = status_tx.send(SyncStatus::Failed);
                    metrics::set_manager_state("failed");
                    run.status = RunStatus::Failed;
                    run.error_message = Some(e.to_string());
                }
                None => {
                    info!(
                        run_id = %run.id,
                        rows = run.total_rows_applied,
                        conflicts = run.conflicts_detected,
                        "Run completed"
                    );
                    run.status = RunStatus::Completed;
                }
            }
            if let Err(e) = store.update_run(&run).await {
                warn!(error = %e, "Failed to finalize run record");
            }
            // Failed auto-transitions back to idle once finalized; drop the
            // run handle in the same breath (it may already be gone if
            // stop() took it).
            *current = None;
            let _ = status_tx.send(SyncStatus::Idle);
            metrics::set_manager_state("idle");
        });

        Ok(ActiveRun {
            run_id,
            shutdown_tx,
            supervisor: Some(supervisor),
            totals,
            degraded,
        })
    }

    /// Stop the current run and wait for both halves to drain. Idempotent.
    pub async fn stop(&self) {
        // Take the run and release the lock before waiting: the supervisor
        // needs it to retire the status.
        let mut run = {
            let mut current = self.current.lock().await;
            match current.take() {
                Some(run) => {
                    self.set_status(SyncStatus::Stopping);
                    run
                }
                None => return,
            }
        };
        info!(run_id = %run.run_id, "Stopping sync");
        let _ = run.shutdown_tx.send(true);
        if let Some(supervisor) = run.supervisor.take() {
            if let Err(e) = supervisor.await {
                warn!(error = %e, "Supervisor task panicked");
                self.set_status(SyncStatus::Idle);
            }
        }
    }

    /// Stop and release the state store.
    pub async fn close(&self) {
        self.stop().await;
        self.store.close().await;
    }
}

fn mode_name(mode: SyncMode) -> &'static str {
    match mode {
        SyncMode::LocalToCloud => "local_to_cloud",
        SyncMode::CloudToLocal => "cloud_to_local",
        SyncMode::Bidirectional => "bidirectional",
    }
}
