// =============================================================================
// Schema migrations — static registry, ordered by timestamp-prefixed name
// =============================================================================
//
// Each entry is a plain function; the runner compares the registry against
// `schema_migrations` and applies whatever is missing, in order, each inside
// its own transaction.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use tracing::info;

type MigrationFn = fn(&Connection) -> rusqlite::Result<()>;

/// All known migrations. Append-only; never reorder or rename an entry that
/// has shipped.
pub(crate) const REGISTRY: &[(&str, MigrationFn)] = &[
    ("20250301_000000_initial_schema", initial_schema),
    ("20250614_101500_cancel_queue", cancel_queue),
    ("20250902_090000_order_tracking_sessions", order_tracking_sessions),
    (
        "20251007_153047_trade_execution_nullable_strategy_account",
        trade_execution_nullable_strategy_account,
    ),
];

/// Apply every migration not yet recorded. Returns how many ran.
pub(crate) fn run_pending(conn: &Connection) -> Result<usize> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            migration_name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )
    .context("create schema_migrations")?;

    let applied = applied_names(conn)?;
    let mut count = 0usize;

    for (name, migration) in REGISTRY {
        if applied.iter().any(|a| a == name) {
            continue;
        }
        conn.execute_batch("BEGIN")?;
        match migration(conn) {
            Ok(()) => {
                conn.execute(
                    "INSERT INTO schema_migrations (migration_name, applied_at) VALUES (?1, ?2)",
                    rusqlite::params![name, Utc::now().to_rfc3339()],
                )?;
                conn.execute_batch("COMMIT")?;
                info!(migration = name, "migration applied");
                count += 1;
            }
            Err(e) => {
                conn.execute_batch("ROLLBACK").ok();
                return Err(e).with_context(|| format!("migration {name} failed"));
            }
        }
    }

    Ok(count)
}

pub(crate) fn applied_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT migration_name FROM schema_migrations ORDER BY migration_name")
        .context("prepare applied_names")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

// ---------------------------------------------------------------------------
// Migration bodies
// ---------------------------------------------------------------------------

fn initial_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            api_token TEXT NOT NULL UNIQUE,
            is_admin INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            name TEXT NOT NULL,
            exchange TEXT NOT NULL,
            account_type TEXT NOT NULL DEFAULT 'CRYPTO',
            api_key TEXT NOT NULL,
            api_secret TEXT NOT NULL,
            passphrase TEXT,
            is_testnet INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX idx_accounts_user ON accounts(user_id);

        CREATE TABLE strategies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            name TEXT NOT NULL,
            group_name TEXT NOT NULL UNIQUE,
            webhook_token TEXT NOT NULL,
            market_type TEXT NOT NULL DEFAULT 'SPOT',
            is_active INTEGER NOT NULL DEFAULT 1,
            is_public INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE strategy_accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            strategy_id INTEGER NOT NULL REFERENCES strategies(id),
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            weight TEXT NOT NULL DEFAULT '1',
            is_active INTEGER NOT NULL DEFAULT 1,
            UNIQUE(strategy_id, account_id)
        );

        CREATE TABLE strategy_capitals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            strategy_account_id INTEGER NOT NULL UNIQUE
                REFERENCES strategy_accounts(id),
            allocated_capital TEXT NOT NULL DEFAULT '0',
            realized_pnl TEXT NOT NULL DEFAULT '0',
            updated_at TEXT NOT NULL
        );

        CREATE TABLE open_orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            strategy_account_id INTEGER NOT NULL REFERENCES strategy_accounts(id),
            exchange_order_id TEXT NOT NULL UNIQUE,
            client_order_id TEXT UNIQUE,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            order_type TEXT NOT NULL,
            price TEXT,
            stop_price TEXT,
            quantity TEXT NOT NULL,
            filled_quantity TEXT NOT NULL DEFAULT '0',
            status TEXT NOT NULL,
            market_type TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX idx_open_orders_sa ON open_orders(strategy_account_id);
        CREATE INDEX idx_open_orders_symbol ON open_orders(symbol);

        CREATE TABLE trade_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            strategy_account_id INTEGER NOT NULL REFERENCES strategy_accounts(id),
            exchange_order_id TEXT NOT NULL,
            exchange_trade_id TEXT UNIQUE,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            execution_price TEXT NOT NULL,
            execution_quantity TEXT NOT NULL,
            commission TEXT NOT NULL DEFAULT '0',
            is_maker INTEGER NOT NULL DEFAULT 0,
            execution_time TEXT NOT NULL,
            market_type TEXT NOT NULL,
            realized_pnl TEXT
        );
        CREATE INDEX idx_trade_executions_order ON trade_executions(exchange_order_id);

        CREATE TABLE strategy_positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            strategy_account_id INTEGER NOT NULL REFERENCES strategy_accounts(id),
            symbol TEXT NOT NULL,
            quantity TEXT NOT NULL DEFAULT '0',
            entry_price TEXT NOT NULL DEFAULT '0',
            realized_pnl TEXT NOT NULL DEFAULT '0',
            updated_at TEXT NOT NULL,
            UNIQUE(strategy_account_id, symbol)
        );

        CREATE TABLE failed_orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            strategy_account_id INTEGER NOT NULL REFERENCES strategy_accounts(id),
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            order_type TEXT NOT NULL,
            quantity TEXT NOT NULL,
            price TEXT,
            stop_price TEXT,
            market_type TEXT NOT NULL,
            reason TEXT NOT NULL,
            exchange_error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            status TEXT NOT NULL DEFAULT 'pending_retry',
            created_at TEXT NOT NULL
        );
        CREATE INDEX idx_failed_orders_sa ON failed_orders(strategy_account_id);

        CREATE TABLE securities_tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL UNIQUE REFERENCES accounts(id),
            access_token TEXT NOT NULL,
            token_type TEXT NOT NULL DEFAULT 'Bearer',
            expires_at TEXT NOT NULL,
            last_refreshed_at TEXT NOT NULL
        );",
    )
}

fn cancel_queue(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE cancel_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_ref TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            next_retry_at TEXT NOT NULL,
            error_message TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX idx_cancel_queue_status ON cancel_queue(status, next_retry_at);",
    )
}

fn order_tracking_sessions(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE order_tracking_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            market_type TEXT NOT NULL,
            connected_at TEXT NOT NULL,
            disconnected_at TEXT,
            disconnect_reason TEXT,
            messages_processed INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX idx_tracking_sessions_account ON order_tracking_sessions(account_id);",
    )
}

/// A StrategyAccount can be unlinked without destroying its fill history:
/// the FK becomes nullable and detach sets it to NULL.
fn trade_execution_nullable_strategy_account(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE trade_executions_new (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            strategy_account_id INTEGER REFERENCES strategy_accounts(id),
            exchange_order_id TEXT NOT NULL,
            exchange_trade_id TEXT UNIQUE,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            execution_price TEXT NOT NULL,
            execution_quantity TEXT NOT NULL,
            commission TEXT NOT NULL DEFAULT '0',
            is_maker INTEGER NOT NULL DEFAULT 0,
            execution_time TEXT NOT NULL,
            market_type TEXT NOT NULL,
            realized_pnl TEXT
        );
        INSERT INTO trade_executions_new SELECT * FROM trade_executions;
        DROP TABLE trade_executions;
        ALTER TABLE trade_executions_new RENAME TO trade_executions;
        CREATE INDEX idx_trade_executions_order ON trade_executions(exchange_order_id);",
    )
}
