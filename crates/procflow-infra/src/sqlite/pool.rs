//! SQLite connection pools.
//!
//! Writes go through a single-connection pool so SQLite never sees two
//! concurrent writers; reads use a separate read-only pool. Both run in WAL
//! mode with foreign keys on. Migrations from `migrations/` are applied on
//! the writer before the reader pool opens.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Connections in the read-only pool.
const READER_CONNECTIONS: u32 = 8;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Reader and writer pools over one database file.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Connect to `database_url` and bring its schema up to date.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(database_url, "sqlite pools ready");
        Ok(Self { reader, writer })
    }

    /// Open the database file at `path`, creating it when absent.
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        Self::new(&format!("sqlite://{}?mode=rwc", path.display())).await
    }
}

/// Directory holding `procflow.db` and `config.toml`.
///
/// Reads `PROCFLOW_DATA_DIR`, falling back to `~/.procflow`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var("PROCFLOW_DATA_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".procflow")
        }
    }
}

/// Default database URL inside [`default_data_dir`].
pub fn default_database_url() -> String {
    format!("sqlite://{}/procflow.db", default_data_dir().display())
}
