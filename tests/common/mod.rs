//! Shared harness for integration tests: an in-memory pipeline wired the
//! same way the manager wires the real one.

#![allow(dead_code)]

use async_trait::async_trait;
use dbsync::applier::{RunTotals, WorkerPool, WorkerPoolConfig};
use dbsync::config::{ConflictResolution, SyncDirection, TableConfig};
use dbsync::conflict::RecentApplies;
use dbsync::destination::{Destination, MemoryDestination};
use dbsync::event::{BinlogPosition, ChangeKind, RowChange, RowImage};
use dbsync::queue::{change_queue, ChangeReceiver, ChangeSender};
use dbsync::store::{
    ConflictRecord, RunRecord, SqliteStateStore, StateStore, TablePosition,
};
use dbsync::Result;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub fn image(pairs: &[(&str, serde_json::Value)]) -> RowImage {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn insert(table: &str, offset: u64, img: RowImage) -> RowChange {
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

pub fn update(table: &str, offset: u64, before: RowImage, after: RowImage) -> RowChange {
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

pub fn delete(table: &str, offset: u64, img: RowImage) -> RowChange {
    RowChange {
        kind: ChangeKind::Delete,
        schema: "app".to_string(),
        table: table.to_string(),
        rows: vec![img],
        before_rows: vec![],
        source_timestamp: 1_700_000_000,
        position: BinlogPosition::new("mysql-bin.000001", offset),
    }
}

/// One pipeline half plus its shared collaborators.
pub struct Pipeline {
    pub destination: Arc<MemoryDestination>,
    pub store: Arc<dyn StateStore>,
    pub recent: Arc<RecentApplies>,
    pub totals: Arc<RunTotals>,
    pub degraded: Arc<std::sync::Mutex<HashSet<String>>>,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl Pipeline {
    pub async fn new() -> Self {
        Self::with_store(Arc::new(SqliteStateStore::open(":memory:").await.unwrap())).await
    }

    pub async fn with_store(store: Arc<dyn StateStore>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            destination: Arc::new(MemoryDestination::new()),
            store,
            recent: Arc::new(RecentApplies::default()),
            totals: Arc::new(RunTotals::default()),
            degraded: Arc::new(std::sync::Mutex::new(HashSet::new())),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawn a pool in `direction` against this pipeline's destination.
    pub fn spawn_pool(
        &self,
        tables: Vec<TableConfig>,
        direction: SyncDirection,
        bidirectional: bool,
        receiver: ChangeReceiver,
    ) -> WorkerPool {
        self.spawn_pool_with(
            WorkerPoolConfig::testing(),
            Arc::clone(&self.destination) as Arc<dyn Destination>,
            tables,
            direction,
            bidirectional,
            receiver,
        )
    }

    pub fn spawn_pool_with(
        &self,
        config: WorkerPoolConfig,
        destination: Arc<dyn Destination>,
        tables: Vec<TableConfig>,
        direction: SyncDirection,
        bidirectional: bool,
        receiver: ChangeReceiver,
    ) -> WorkerPool {
        WorkerPool::spawn(
            config,
            tables,
            direction,
            destination,
            Arc::clone(&self.store),
            Arc::clone(&self.recent),
            bidirectional,
            receiver,
            self.shutdown_rx.clone(),
            Arc::clone(&self.totals),
            Arc::clone(&self.degraded),
        )
    }

    pub fn queue(&self, capacity: usize) -> (ChangeSender, ChangeReceiver) {
        change_queue(capacity)
    }
}

pub fn lww_table(name: &str) -> TableConfig {
    TableConfig::for_testing(name)
}

pub fn manual_table(name: &str) -> TableConfig {
    TableConfig {
        conflict_resolution: ConflictResolution::Manual,
        ..TableConfig::for_testing(name)
    }
}

/// State store wrapper that fails a configurable number of position
/// upserts, for exercising the escalation path.
pub struct FlakyStore {
    inner: SqliteStateStore,
    fail_upserts: AtomicU64,
}

impl FlakyStore {
    pub async fn new() -> Self {
        Self {
            inner: SqliteStateStore::open(":memory:").await.unwrap(),
            fail_upserts: AtomicU64::new(0),
        }
    }

    pub fn fail_upserts(&self, n: u64) {
        self.fail_upserts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get_position(
        &self,
        table: &str,
        direction: SyncDirection,
    ) -> Result<Option<TablePosition>> {
        self.inner.get_position(table, direction).await
    }

    async fn upsert_position(&self, position: &TablePosition) -> Result<()> {
        let remaining = self.fail_upserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_upserts.store(remaining - 1, Ordering::SeqCst);
            return Err(dbsync::SyncError::StateStore(sqlx::Error::PoolTimedOut));
        }
        self.inner.upsert_position(position).await
    }

    async fn create_conflict(&self, conflict: &ConflictRecord) -> Result<()> {
        self.inner.create_conflict(conflict).await
    }

    async fn get_conflict(&self, id: &str) -> Result<Option<ConflictRecord>> {
        self.inner.get_conflict(id).await
    }

    async fn list_conflicts(
        &self,
        resolved: Option<bool>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConflictRecord>> {
        self.inner.list_conflicts(resolved, limit, offset).await
    }

    async fn resolve_conflict(
        &self,
        id: &str,
        strategy: ConflictResolution,
        resolved_image: &RowImage,
    ) -> Result<()> {
        self.inner.resolve_conflict(id, strategy, resolved_image).await
    }

    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        self.inner.create_run(run).await
    }

    async fn update_run(&self, run: &RunRecord) -> Result<()> {
        self.inner.update_run(run).await
    }

    async fn list_runs(&self, limit: u32, offset: u32) -> Result<Vec<RunRecord>> {
        self.inner.list_runs(limit, offset).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
