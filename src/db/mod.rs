// =============================================================================
// SQLite persistence layer
// =============================================================================
//
// One connection behind an async mutex; every unit of work takes the lock for
// a single transaction and releases it before any await on the network.
// Monetary columns are TEXT holding canonical Decimal strings — SQLite REAL
// would round-trip through binary float.
// =============================================================================

mod accounts;
mod migrations;
mod models;
mod orders;
mod positions;

pub use accounts::BindingContext;
pub use models::*;
pub use orders::{OpenOrderFilter, PENDING_ID_PREFIX};
pub use positions::{apply_fill_to_position, FillOutcome};

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

/// Shared handle to the gateway database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database at `path` and bring the schema
    /// up to date.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("open gateway db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        let applied = migrations::run_pending(&conn)?;
        if applied > 0 {
            info!(applied, path, "database migrations applied");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        migrations::run_pending(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Acquire the connection for a multi-statement transaction. Callers must
    /// not hold the guard across network awaits.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Names of migrations already recorded as applied.
    pub async fn applied_migrations(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        migrations::applied_names(&conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Decimal <-> TEXT helpers shared by the query modules
// ---------------------------------------------------------------------------

pub(crate) fn dec_to_sql(value: Decimal) -> String {
    value.normalize().to_string()
}

pub(crate) fn dec_from_sql(raw: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

pub(crate) fn opt_dec_to_sql(value: Option<Decimal>) -> Option<String> {
    value.map(dec_to_sql)
}

pub(crate) fn opt_dec_from_sql(raw: Option<String>) -> rusqlite::Result<Option<Decimal>> {
    raw.map(|s| dec_from_sql(&s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn open_in_memory_applies_all_migrations() {
        let db = Database::open_in_memory().unwrap();
        let applied = db.applied_migrations().await.unwrap();
        assert_eq!(applied.len(), migrations::REGISTRY.len());
    }

    #[tokio::test]
    async fn reopening_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        let path = path.to_str().unwrap();

        let db = Database::open(path).unwrap();
        drop(db);
        let db = Database::open(path).unwrap();
        let applied = db.applied_migrations().await.unwrap();
        assert_eq!(applied.len(), migrations::REGISTRY.len());
    }

    #[test]
    fn decimal_round_trips_through_text() {
        for d in [dec!(0.00001), dec!(-3.14), dec!(42000), Decimal::ZERO] {
            assert_eq!(dec_from_sql(&dec_to_sql(d)).unwrap(), d.normalize());
        }
    }
}
