//! # dbsync
//!
//! A bidirectional MySQL replication bridge: tails the source's binlog,
//! applies row changes at the destination, detects per-row divergence, and
//! persists enough state to resume after any restart without losing or
//! duplicating changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                 dbsync                                   │
//! │                                                                          │
//! │  ┌────────────────┐   ┌─────────────┐   ┌─────────────────────────────┐  │
//! │  │ BinlogListener │──►│ ChangeQueue │──►│ WorkerPool (hash by table)  │  │
//! │  │ (replica conn) │   │ (bounded)   │   │ batch → tx → apply → upsert │  │
//! │  └────────────────┘   └─────────────┘   └─────────────┬───────────────┘  │
//! │          │                                            │                  │
//! │          ▼                                            ▼                  │
//! │  ┌────────────────┐                      ┌─────────────────────────┐     │
//! │  │ SyncManager    │                      │ ConflictEngine          │     │
//! │  │ (lifecycle,    │                      │ (hash compare, LWW /    │     │
//! │  │  run records)  │                      │  priority / manual)     │     │
//! │  └────────────────┘                      └─────────────────────────┘     │
//! │          │                                            │                  │
//! │          └────────────────────┬───────────────────────┘                  │
//! │                               ▼                                          │
//! │                    ┌─────────────────────┐                               │
//! │                    │ StateStore          │                               │
//! │                    │ (MySQL | SQLite)    │                               │
//! │                    └─────────────────────┘                               │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! In bidirectional mode two listener + pool pairs run in opposite
//! directions, sharing the conflict engine's recent-applies cache and the
//! state store.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dbsync::{Config, SyncManager};
//! use dbsync::store::open_store;
//!
//! #[tokio::main]
//! async fn main() -> dbsync::Result<()> {
//!     let config = Config::for_testing();
//!     let store = open_store(&config.state_storage).await?;
//!
//!     let manager = SyncManager::new(config, store);
//!     manager.start().await?;
//!
//!     // ... runs until stopped
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```

pub mod applier;
pub mod canonical;
pub mod config;
pub mod conflict;
pub mod destination;
pub mod dml;
pub mod error;
pub mod event;
pub mod listener;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use applier::{WorkerPool, WorkerPoolConfig};
pub use config::{Config, ConflictResolution, SyncDirection, SyncMode, TableConfig};
pub use conflict::{ConflictEngine, ConflictKind, RecentApplies};
pub use destination::{Destination, MemoryDestination, MySqlDestination};
pub use error::{Result, SyncError};
pub use event::{BinlogPosition, ChangeKind, RowChange, RowImage};
pub use listener::{BinlogListener, ListenerState};
pub use manager::{StatusSnapshot, SyncManager, SyncStatus};
pub use queue::{change_queue, ChangeReceiver, ChangeSender};
pub use store::{ConflictRecord, RunRecord, StateStore, TablePosition};
