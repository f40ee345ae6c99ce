//! SQLite connection pool shared by every store.
//!
//! Each store operation checks a connection out for the duration of that one
//! operation. WAL mode plus a busy timeout lets the control loops, the sensor
//! pollers and the HTTP workers write concurrently without `database is
//! locked` failures.

use core::fmt;
use diesel::SqliteConnection;
use diesel::connection::SimpleConnection;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::info;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const BUSY_TIMEOUT_MS: u64 = 5_000;
const MAX_POOL_SIZE: u32 = 8;

pub type Pool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

/// Connection or query failure on the durable store.
#[derive(Debug)]
pub enum StorageError {
    Pool(r2d2::PoolError),
    Query(diesel::result::Error),
    Migration(String),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Pool(e) => write!(f, "connection pool error: {}", e),
            StorageError::Query(e) => write!(f, "query failed: {}", e),
            StorageError::Migration(e) => write!(f, "migration failed: {}", e),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StorageError::Pool(e) => Some(e),
            StorageError::Query(e) => Some(e),
            StorageError::Migration(_) => None,
        }
    }
}

impl From<r2d2::PoolError> for StorageError {
    fn from(value: r2d2::PoolError) -> Self {
        StorageError::Pool(value)
    }
}

impl From<diesel::result::Error> for StorageError {
    fn from(value: diesel::result::Error) -> Self {
        StorageError::Query(value)
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}; PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;"
        ))
        .map_err(r2d2::Error::QueryError)
    }
}

/// Open (creating if needed) the database at `path` and bring its schema up to date.
pub fn open(path: &str) -> Result<Pool, StorageError> {
    let manager = ConnectionManager::<SqliteConnection>::new(path);
    let pool = r2d2::Pool::builder()
        .max_size(MAX_POOL_SIZE)
        .connection_timeout(Duration::from_secs(10))
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)
        .map_err(StorageError::Pool)?;

    let mut conn = pool.get()?;
    apply_migrations(&mut conn)?;
    Ok(pool)
}

fn apply_migrations(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    if applied.is_empty() {
        info!("Database schema is up to date; no migrations were applied");
    } else {
        let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
        info!("Applied {} database migration(s): {}", applied.len(), names);
    }
    Ok(())
}
