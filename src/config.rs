//! Configuration for the sync service.
//!
//! This module defines all configuration types needed to run the sync
//! pipeline. Configuration is passed to
//! [`SyncManager::new()`](crate::manager::SyncManager::new) and can be
//! constructed programmatically or deserialized from YAML/JSON.
//!
//! # Configuration Structure
//!
//! ```text
//! Config
//! ├── databases
//! │   ├── local: DatabaseConnection    # source/destination pair
//! │   └── cloud: DatabaseConnection
//! ├── state_storage: StateStorageConfig # mysql | sqlite
//! ├── sync: SyncSettings
//! │   ├── mode, workers, realtime, batch_insert_size
//! │   └── tables: Vec<TableConfig>
//! ├── scheduler: SchedulerConfig        # external cron fallback
//! ├── server: ServerConfig              # external HTTP layer
//! └── logging: LoggingConfig
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! databases:
//!   local:
//!     host: "127.0.0.1"
//!     port: 3306
//!     user: "app"
//!     password: "secret"
//!     database: "app"
//!     replication_user: "repl"
//!     replication_password: "secret"
//!   cloud:
//!     host: "db.example.com"
//!     port: 3306
//!     user: "app"
//!     password: "secret"
//!     database: "app"
//!     replication_user: "repl"
//!     replication_password: "secret"
//!
//! state_storage:
//!   type: sqlite
//!   file_path: "/var/lib/dbsync/state.db"
//!
//! sync:
//!   mode: bidirectional
//!   workers: 8
//!   realtime: true
//!   batch_insert_size: 1000
//!   tables:
//!     - name: users
//!       conflict_resolution: last_write_wins
//!       primary_key: id
//!       timestamp_column: updated_at
//! ```

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The top-level config object passed to `SyncManager::new()`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub databases: DatabasesConfig,
    #[serde(default)]
    pub state_storage: StateStorageConfig,
    pub sync: SyncSettings,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The local/cloud database pair.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabasesConfig {
    pub local: DatabaseConnection,
    pub cloud: DatabaseConnection,
}

/// Connection settings for one database instance.
///
/// `user`/`password` are used for DML application; `replication_user`/
/// `replication_password` for the binlog stream (the replication account
/// needs `REPLICATION SLAVE` and `REPLICATION CLIENT` grants).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConnection {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub replication_user: String,
    #[serde(default)]
    pub replication_password: String,
}

fn default_mysql_port() -> u16 {
    3306
}

impl DatabaseConnection {
    /// `host:port` endpoint string for logging and error context.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// sqlx connection URL for DML application.
    pub fn dml_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Where durable sync state (positions, conflicts, history) lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateStorageConfig {
    /// `mysql` or `sqlite`.
    #[serde(rename = "type", default = "default_store_type")]
    pub store_type: StoreType,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
    /// SQLite only.
    #[serde(default)]
    pub file_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Mysql,
    Sqlite,
}

fn default_store_type() -> StoreType {
    StoreType::Sqlite
}

impl Default for StateStorageConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::Sqlite,
            host: String::new(),
            port: 3306,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            file_path: "dbsync_state.db".to_string(),
        }
    }
}

impl StateStorageConfig {
    /// In-memory SQLite config for testing.
    pub fn in_memory() -> Self {
        Self {
            file_path: ":memory:".to_string(),
            ..Default::default()
        }
    }
}

/// Direction of a one-way replication half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncDirection {
    #[serde(rename = "local_to_cloud")]
    LocalToCloud,
    #[serde(rename = "cloud_to_local")]
    CloudToLocal,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::LocalToCloud => "local_to_cloud",
            SyncDirection::CloudToLocal => "cloud_to_local",
        }
    }

    /// The opposite direction.
    pub fn reverse(&self) -> Self {
        match self {
            SyncDirection::LocalToCloud => SyncDirection::CloudToLocal,
            SyncDirection::CloudToLocal => SyncDirection::LocalToCloud,
        }
    }
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    LocalToCloud,
    CloudToLocal,
    Bidirectional,
}

impl SyncMode {
    /// The directions this mode runs.
    pub fn directions(&self) -> Vec<SyncDirection> {
        match self {
            SyncMode::LocalToCloud => vec![SyncDirection::LocalToCloud],
            SyncMode::CloudToLocal => vec![SyncDirection::CloudToLocal],
            SyncMode::Bidirectional => {
                vec![SyncDirection::LocalToCloud, SyncDirection::CloudToLocal]
            }
        }
    }

    pub fn is_bidirectional(&self) -> bool {
        matches!(self, SyncMode::Bidirectional)
    }
}

/// Tunables for the change-propagation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_mode")]
    pub mode: SyncMode,
    /// Worker count for the applier pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Whether to run the realtime binlog pipeline (vs. scheduler-only).
    #[serde(default = "default_true")]
    pub realtime: bool,
    /// Per-batch row cap before a worker flushes.
    #[serde(default = "default_batch_insert_size")]
    pub batch_insert_size: usize,
    /// Bounded change-queue capacity between listener and pool.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Replica server id for the local-to-cloud listener; the reverse
    /// listener uses `server_id + 1` so the two never collide.
    #[serde(default = "default_server_id")]
    pub server_id: u32,
    pub tables: Vec<TableConfig>,
}

fn default_mode() -> SyncMode {
    SyncMode::LocalToCloud
}

fn default_workers() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_batch_insert_size() -> usize {
    1000
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_server_id() -> u32 {
    4100
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mode: SyncMode::LocalToCloud,
            workers: 8,
            realtime: true,
            batch_insert_size: 1000,
            queue_capacity: 10_000,
            server_id: 4100,
            tables: Vec::new(),
        }
    }
}

/// How to resolve a divergent row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    LastWriteWins,
    SourcePriority,
    Manual,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::LastWriteWins => "last_write_wins",
            ConflictResolution::SourcePriority => "source_priority",
            ConflictResolution::Manual => "manual",
        }
    }
}

/// Per-table sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    #[serde(default = "default_resolution")]
    pub conflict_resolution: ConflictResolution,
    /// Overrides `sync.batch_insert_size` for this table when set.
    #[serde(default)]
    pub batch_size: Option<usize>,
    pub primary_key: String,
    /// Column compared by `last_write_wins`; also excluded from content
    /// hashing so a touch-only update does not read as divergence.
    #[serde(default)]
    pub timestamp_column: Option<String>,
    /// Which side wins under `source_priority`.
    #[serde(default = "default_priority_side")]
    pub priority_side: PrioritySide,
}

fn default_resolution() -> ConflictResolution {
    ConflictResolution::Manual
}

fn default_priority_side() -> PrioritySide {
    PrioritySide::Local
}

/// Declared winning side for `source_priority`, and the tie-break
/// precedence for `last_write_wins`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrioritySide {
    Local,
    Cloud,
}

impl TableConfig {
    /// Minimal table config for testing.
    pub fn for_testing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            conflict_resolution: ConflictResolution::LastWriteWins,
            batch_size: None,
            primary_key: "id".to_string(),
            timestamp_column: Some("updated_at".to_string()),
            priority_side: PrioritySide::Local,
        }
    }
}

/// External cron fallback scheduler (contract only; the scheduler itself
/// lives outside this crate and is expected to no-op while a realtime run
/// is healthy).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Cron expression.
    #[serde(default)]
    pub interval: String,
}

/// External HTTP control surface settings (contract only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_http_timeout")]
    pub read_timeout: String,
    #[serde(default = "default_http_timeout")]
    pub write_timeout: String,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_server_port() -> u16 {
    8080
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_timeout() -> String {
    "30s".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            auth_token: String::new(),
            read_timeout: "30s".to_string(),
            write_timeout: "30s".to_string(),
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn read_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.read_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn write_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.write_timeout).unwrap_or(Duration::from_secs(30))
    }
}

/// Logging settings, consumed by the daemon's tracing-subscriber setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `json` or `text`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Config {
    /// Validate the configuration before a run starts.
    ///
    /// A failed validation keeps the manager in `idle`.
    pub fn validate(&self) -> Result<()> {
        if self.sync.tables.is_empty() {
            return Err(SyncError::Config("no tables configured".to_string()));
        }
        if self.sync.workers == 0 {
            return Err(SyncError::Config("sync.workers must be at least 1".to_string()));
        }
        if self.sync.batch_insert_size == 0 {
            return Err(SyncError::Config(
                "sync.batch_insert_size must be at least 1".to_string(),
            ));
        }
        for table in &self.sync.tables {
            if table.name.is_empty() {
                return Err(SyncError::Config("table with empty name".to_string()));
            }
            if table.primary_key.is_empty() {
                return Err(SyncError::Config(format!(
                    "table {} has no primary_key",
                    table.name
                )));
            }
            if table.conflict_resolution == ConflictResolution::LastWriteWins
                && table.timestamp_column.is_none()
            {
                return Err(SyncError::Config(format!(
                    "table {} uses last_write_wins but has no timestamp_column",
                    table.name
                )));
            }
        }
        match self.state_storage.store_type {
            StoreType::Sqlite => {
                if self.state_storage.file_path.is_empty() {
                    return Err(SyncError::Config(
                        "state_storage.file_path required for sqlite".to_string(),
                    ));
                }
            }
            StoreType::Mysql => {
                if self.state_storage.host.is_empty() || self.state_storage.database.is_empty() {
                    return Err(SyncError::Config(
                        "state_storage.host and database required for mysql".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Minimal valid config for testing.
    pub fn for_testing() -> Self {
        Self {
            databases: DatabasesConfig {
                local: DatabaseConnection {
                    host: "127.0.0.1".to_string(),
                    port: 3306,
                    user: "root".to_string(),
                    password: String::new(),
                    database: "app".to_string(),
                    replication_user: "repl".to_string(),
                    replication_password: String::new(),
                },
                cloud: DatabaseConnection {
                    host: "127.0.0.1".to_string(),
                    port: 3307,
                    user: "root".to_string(),
                    password: String::new(),
                    database: "app".to_string(),
                    replication_user: "repl".to_string(),
                    replication_password: String::new(),
                },
            },
            state_storage: StateStorageConfig::in_memory(),
            sync: SyncSettings {
                tables: vec![TableConfig::for_testing("users")],
                ..Default::default()
            },
            scheduler: SchedulerConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Find the configuration for a table by name.
    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.sync.tables.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_testing_validates() {
        assert!(Config::for_testing().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_tables() {
        let mut config = Config::for_testing();
        config.sync.tables.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no tables"));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::for_testing();
        config.sync.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::for_testing();
        config.sync.batch_insert_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_primary_key() {
        let mut config = Config::for_testing();
        config.sync.tables[0].primary_key = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("primary_key"));
    }

    #[test]
    fn test_validate_rejects_lww_without_timestamp() {
        let mut config = Config::for_testing();
        config.sync.tables[0].conflict_resolution = ConflictResolution::LastWriteWins;
        config.sync.tables[0].timestamp_column = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timestamp_column"));
    }

    #[test]
    fn test_validate_rejects_sqlite_without_path() {
        let mut config = Config::for_testing();
        config.state_storage.file_path = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_mysql_store_without_host() {
        let mut config = Config::for_testing();
        config.state_storage.store_type = StoreType::Mysql;
        config.state_storage.host = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sync_mode_directions() {
        assert_eq!(
            SyncMode::LocalToCloud.directions(),
            vec![SyncDirection::LocalToCloud]
        );
        assert_eq!(
            SyncMode::CloudToLocal.directions(),
            vec![SyncDirection::CloudToLocal]
        );
        assert_eq!(SyncMode::Bidirectional.directions().len(), 2);
        assert!(SyncMode::Bidirectional.is_bidirectional());
        assert!(!SyncMode::LocalToCloud.is_bidirectional());
    }

    #[test]
    fn test_direction_reverse() {
        assert_eq!(
            SyncDirection::LocalToCloud.reverse(),
            SyncDirection::CloudToLocal
        );
        assert_eq!(
            SyncDirection::CloudToLocal.reverse(),
            SyncDirection::LocalToCloud
        );
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(SyncDirection::LocalToCloud.to_string(), "local_to_cloud");
        assert_eq!(SyncDirection::CloudToLocal.to_string(), "cloud_to_local");
    }

    #[test]
    fn test_sync_settings_defaults() {
        let settings = SyncSettings::default();
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.batch_insert_size, 1000);
        assert_eq!(settings.queue_capacity, 10_000);
        assert!(settings.realtime);
    }

    #[test]
    fn test_database_connection_urls() {
        let conn = DatabaseConnection {
            host: "db.example.com".to_string(),
            port: 3306,
            user: "app".to_string(),
            password: "pw".to_string(),
            database: "main".to_string(),
            replication_user: "repl".to_string(),
            replication_password: "rpw".to_string(),
        };
        assert_eq!(conn.endpoint(), "db.example.com:3306");
        assert_eq!(conn.dml_url(), "mysql://app:pw@db.example.com:3306/main");
    }

    #[test]
    fn test_server_timeouts_parse() {
        let server = ServerConfig {
            read_timeout: "10s".to_string(),
            write_timeout: "1m".to_string(),
            ..Default::default()
        };
        assert_eq!(server.read_timeout_duration(), Duration::from_secs(10));
        assert_eq!(server.write_timeout_duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_server_timeout_invalid_fallback() {
        let server = ServerConfig {
            read_timeout: "not-a-duration".to_string(),
            ..Default::default()
        };
        assert_eq!(server.read_timeout_duration(), Duration::from_secs(30));
    }

    #[test]
    fn test_mode_serde_names() {
        let json = serde_json::to_string(&SyncMode::Bidirectional).unwrap();
        assert_eq!(json, "\"bidirectional\"");
        let parsed: SyncMode = serde_json::from_str("\"local_to_cloud\"").unwrap();
        assert_eq!(parsed, SyncMode::LocalToCloud);
    }

    #[test]
    fn test_store_type_serde_names() {
        let parsed: StoreType = serde_json::from_str("\"mysql\"").unwrap();
        assert_eq!(parsed, StoreType::Mysql);
        let parsed: StoreType = serde_json::from_str("\"sqlite\"").unwrap();
        assert_eq!(parsed, StoreType::Sqlite);
    }

    #[test]
    fn test_resolution_serde_names() {
        let parsed: ConflictResolution =
            serde_json::from_str("\"last_write_wins\"").unwrap();
        assert_eq!(parsed, ConflictResolution::LastWriteWins);
        let parsed: ConflictResolution = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(parsed, ConflictResolution::Manual);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = Config::for_testing();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sync.tables.len(), 1);
        assert_eq!(parsed.sync.tables[0].name, "users");
        assert_eq!(parsed.state_storage.file_path, ":memory:");
    }

    #[test]
    fn test_table_lookup() {
        let config = Config::for_testing();
        assert!(config.table("users").is_some());
        assert!(config.table("missing").is_none());
    }
}
