pub mod catalog;
pub mod models;
pub mod price_store;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::warn;

use crate::error::Result;

pub use catalog::Catalog;
pub use price_store::PriceStore;

/// Opens (creating if missing) the SQLite database and applies migrations.
pub async fn connect(db_path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

// ---------------------------------------------------------------------------
// Per-record savepoints
// ---------------------------------------------------------------------------

pub(crate) async fn savepoint(conn: &mut SqliteConnection, name: &str) -> Result<()> {
    sqlx::query(&format!("SAVEPOINT {name}")).execute(&mut *conn).await?;
    Ok(())
}

pub(crate) async fn release_savepoint(conn: &mut SqliteConnection, name: &str) -> Result<()> {
    sqlx::query(&format!("RELEASE {name}")).execute(&mut *conn).await?;
    Ok(())
}

/// Undoes a failed record. Never fails: the record is already counted as failed, and the
/// enclosing transaction stays usable for the rest of the batch.
pub(crate) async fn rollback_savepoint(conn: &mut SqliteConnection, name: &str) {
    if let Err(e) = sqlx::query(&format!("ROLLBACK TO {name}")).execute(&mut *conn).await {
        warn!(savepoint = name, "Savepoint rollback failed: {e}");
        return;
    }
    if let Err(e) = sqlx::query(&format!("RELEASE {name}")).execute(&mut *conn).await {
        warn!(savepoint = name, "Savepoint release failed: {e}");
    }
}

/// Single-connection in-memory database; every connection to `:memory:` is a fresh DB.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations apply");
    pool
}
