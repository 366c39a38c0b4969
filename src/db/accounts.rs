// =============================================================================
// Identity queries — users, accounts, strategies, bindings, securities tokens
// =============================================================================
//
// The cyclic back-references of the source data model are expressed here as
// explicit joins; nothing mutates an object graph through two paths.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::types::MarketType;

use super::models::*;
use super::{dec_to_sql, Database};

/// Everything the fill pipeline and SSE hub need to know about one binding.
#[derive(Debug, Clone)]
pub struct BindingContext {
    pub strategy_account_id: i64,
    pub strategy_id: i64,
    pub strategy_active: bool,
    pub user_id: i64,
    pub account_id: i64,
    pub account_name: String,
    pub exchange: String,
    pub market_type: MarketType,
}

impl Database {
    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    /// Resolve a bearer token to its active user.
    pub async fn user_by_api_token(&self, token: &str) -> Result<Option<UserRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM users WHERE api_token = ?1 AND is_active = 1",
            params![token],
            |row| UserRow::from_row(row),
        )
        .optional()
        .context("user_by_api_token")
    }

    // -------------------------------------------------------------------------
    // Accounts
    // -------------------------------------------------------------------------

    pub async fn account_by_id(&self, account_id: i64) -> Result<Option<AccountRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM accounts WHERE id = ?1",
            params![account_id],
            |row| AccountRow::from_row(row),
        )
        .optional()
        .context("account_by_id")
    }

    /// Active (account, market_type) pairs that currently have at least one
    /// active strategy binding — the set the reconciler and the WS pool
    /// iterate over.
    pub async fn active_account_markets(&self) -> Result<Vec<(AccountRow, MarketType)>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT a.*, s.market_type AS binding_market
             FROM accounts a
             JOIN strategy_accounts sa ON sa.account_id = a.id AND sa.is_active = 1
             JOIN strategies s ON s.id = sa.strategy_id AND s.is_active = 1
             WHERE a.is_active = 1
             ORDER BY a.id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let account = AccountRow::from_row(row)?;
                let market: String = row.get("binding_market")?;
                Ok((account, market))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (account, market) in rows {
            let market_type = MarketType::parse(&market)
                .with_context(|| format!("invalid market_type '{market}'"))?;
            out.push((account, market_type));
        }
        Ok(out)
    }

    pub async fn set_account_active(&self, account_id: i64, active: bool) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE accounts SET is_active = ?2 WHERE id = ?1",
            params![account_id, active],
        )?;
        Ok(())
    }

    /// (user_id, strategy_id) pairs whose strategies bind this account —
    /// the SSE keys to drop when the account goes away.
    pub async fn active_bindings_for_account(
        &self,
        account_id: i64,
    ) -> Result<Vec<(i64, i64)>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT s.user_id, s.id
             FROM strategy_accounts sa
             JOIN strategies s ON s.id = sa.strategy_id
             WHERE sa.account_id = ?1 AND sa.is_active = 1",
        )?;
        let rows = stmt
            .query_map(params![account_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Strategies
    // -------------------------------------------------------------------------

    pub async fn strategy_by_id(&self, strategy_id: i64) -> Result<Option<StrategyRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM strategies WHERE id = ?1",
            params![strategy_id],
            |row| StrategyRow::from_row(row),
        )
        .optional()
        .context("strategy_by_id")
    }

    /// Webhook routing key lookup.
    pub async fn strategy_by_group_name(&self, group_name: &str) -> Result<Option<StrategyRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM strategies WHERE group_name = ?1",
            params![group_name],
            |row| StrategyRow::from_row(row),
        )
        .optional()
        .context("strategy_by_group_name")
    }

    pub async fn strategy_is_active(&self, strategy_id: i64) -> Result<bool> {
        let conn = self.lock().await;
        let active: Option<bool> = conn
            .query_row(
                "SELECT is_active FROM strategies WHERE id = ?1",
                params![strategy_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(active.unwrap_or(false))
    }

    /// Subscriber access check: strategy owner, or owner of any account bound
    /// to the strategy.
    pub async fn user_can_access_strategy(&self, user_id: i64, strategy_id: i64) -> Result<bool> {
        let conn = self.lock().await;
        let owner: Option<i64> = conn
            .query_row(
                "SELECT user_id FROM strategies WHERE id = ?1",
                params![strategy_id],
                |row| row.get(0),
            )
            .optional()?;
        match owner {
            None => Ok(false),
            Some(uid) if uid == user_id => Ok(true),
            Some(_) => {
                let bound: i64 = conn.query_row(
                    "SELECT COUNT(*)
                     FROM strategy_accounts sa
                     JOIN accounts a ON a.id = sa.account_id
                     WHERE sa.strategy_id = ?1 AND a.user_id = ?2",
                    params![strategy_id, user_id],
                    |row| row.get(0),
                )?;
                Ok(bound > 0)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Bindings
    // -------------------------------------------------------------------------

    /// Active bindings of a strategy with their accounts, in stable id order.
    pub async fn active_bindings(&self, strategy_id: i64) -> Result<Vec<BindingRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT sa.id AS sa_id, sa.strategy_id, sa.account_id, sa.weight,
                    sa.is_active AS sa_active, a.*
             FROM strategy_accounts sa
             JOIN accounts a ON a.id = sa.account_id
             WHERE sa.strategy_id = ?1 AND sa.is_active = 1 AND a.is_active = 1
             ORDER BY sa.id",
        )?;
        let rows = stmt
            .query_map(params![strategy_id], |row| {
                let strategy_account = StrategyAccountRow {
                    id: row.get("sa_id")?,
                    strategy_id: row.get("strategy_id")?,
                    account_id: row.get("account_id")?,
                    weight: super::dec_from_sql(&row.get::<_, String>("weight")?)?,
                    is_active: row.get("sa_active")?,
                };
                let account = AccountRow::from_row(row)?;
                Ok(BindingRow {
                    strategy_account,
                    account,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn strategy_account_by_id(
        &self,
        strategy_account_id: i64,
    ) -> Result<Option<StrategyAccountRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM strategy_accounts WHERE id = ?1",
            params![strategy_account_id],
            |row| StrategyAccountRow::from_row(row),
        )
        .optional()
        .context("strategy_account_by_id")
    }

    /// Joined context for one binding, used when turning fills into events.
    pub async fn binding_context(&self, strategy_account_id: i64) -> Result<Option<BindingContext>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT sa.id AS sa_id, s.id AS strategy_id, s.is_active AS strategy_active,
                    s.user_id, s.market_type, a.id AS account_id, a.name AS account_name,
                    a.exchange
             FROM strategy_accounts sa
             JOIN strategies s ON s.id = sa.strategy_id
             JOIN accounts a ON a.id = sa.account_id
             WHERE sa.id = ?1",
            params![strategy_account_id],
            |row| {
                let market: String = row.get("market_type")?;
                Ok(BindingContext {
                    strategy_account_id: row.get("sa_id")?,
                    strategy_id: row.get("strategy_id")?,
                    strategy_active: row.get("strategy_active")?,
                    user_id: row.get("user_id")?,
                    account_id: row.get("account_id")?,
                    account_name: row.get("account_name")?,
                    exchange: row.get("exchange")?,
                    market_type: MarketType::parse(&market).unwrap_or(MarketType::Spot),
                })
            },
        )
        .optional()
        .context("binding_context")
    }

    /// Detach a binding while preserving its fill history: executions keep
    /// their rows with a NULL foreign key.
    pub async fn detach_strategy_account(&self, strategy_account_id: i64) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE trade_executions SET strategy_account_id = NULL
             WHERE strategy_account_id = ?1",
            params![strategy_account_id],
        )?;
        conn.execute(
            "UPDATE strategy_accounts SET is_active = 0 WHERE id = ?1",
            params![strategy_account_id],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Securities tokens
    // -------------------------------------------------------------------------

    pub async fn securities_token(&self, account_id: i64) -> Result<Option<SecuritiesTokenRow>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM securities_tokens WHERE account_id = ?1",
            params![account_id],
            |row| SecuritiesTokenRow::from_row(row),
        )
        .optional()
        .context("securities_token")
    }

    /// Store a freshly issued token; `last_refreshed_at` advances exactly
    /// once per real OAuth round-trip.
    pub async fn upsert_securities_token(
        &self,
        account_id: i64,
        access_token: &str,
        token_type: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO securities_tokens
                (account_id, access_token, token_type, expires_at, last_refreshed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(account_id) DO UPDATE SET
                access_token = excluded.access_token,
                token_type = excluded.token_type,
                expires_at = excluded.expires_at,
                last_refreshed_at = excluded.last_refreshed_at",
            params![
                account_id,
                access_token,
                token_type,
                expires_at.to_rfc3339(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stream tracking telemetry
    // -------------------------------------------------------------------------

    pub async fn open_tracking_session(
        &self,
        account_id: i64,
        market_type: MarketType,
    ) -> Result<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO order_tracking_sessions (account_id, market_type, connected_at)
             VALUES (?1, ?2, ?3)",
            params![account_id, market_type.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn close_tracking_session(
        &self,
        session_id: i64,
        reason: &str,
        messages_processed: u64,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE order_tracking_sessions
             SET disconnected_at = ?2, disconnect_reason = ?3, messages_processed = ?4
             WHERE id = ?1",
            params![
                session_id,
                Utc::now().to_rfc3339(),
                reason,
                messages_processed as i64
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fixture helpers (tests and bootstrap)
    // -------------------------------------------------------------------------

    pub async fn insert_user(&self, username: &str, api_token: &str, is_admin: bool) -> Result<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO users (username, api_token, is_admin) VALUES (?1, ?2, ?3)",
            params![username, api_token, is_admin],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_account(
        &self,
        user_id: i64,
        name: &str,
        exchange: &str,
        account_type: &str,
        api_key: &str,
        api_secret: &str,
        is_testnet: bool,
    ) -> Result<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO accounts (user_id, name, exchange, account_type, api_key,
                api_secret, is_testnet)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![user_id, name, exchange, account_type, api_key, api_secret, is_testnet],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn insert_strategy(
        &self,
        user_id: i64,
        name: &str,
        group_name: &str,
        webhook_token: &str,
        market_type: MarketType,
    ) -> Result<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO strategies (user_id, name, group_name, webhook_token, market_type)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, name, group_name, webhook_token, market_type.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn insert_strategy_account(
        &self,
        strategy_id: i64,
        account_id: i64,
        weight: rust_decimal::Decimal,
    ) -> Result<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO strategy_accounts (strategy_id, account_id, weight)
             VALUES (?1, ?2, ?3)",
            params![strategy_id, account_id, dec_to_sql(weight)],
        )?;
        let sa_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO strategy_capitals (strategy_account_id, allocated_capital,
                realized_pnl, updated_at)
             VALUES (?1, '0', '0', ?2)",
            params![sa_id, Utc::now().to_rfc3339()],
        )?;
        Ok(sa_id)
    }

    pub async fn set_strategy_active(&self, strategy_id: i64, active: bool) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE strategies SET is_active = ?2 WHERE id = ?1",
            params![strategy_id, active],
        )?;
        Ok(())
    }

    /// Soft-delete a strategy and deactivate its bindings. Fill history stays
    /// intact; callers force-disconnect SSE subscribers BEFORE calling this.
    pub async fn remove_strategy(&self, strategy_id: i64) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE strategy_accounts SET is_active = 0 WHERE strategy_id = ?1",
            params![strategy_id],
        )?;
        conn.execute(
            "UPDATE strategies SET is_active = 0 WHERE id = ?1",
            params![strategy_id],
        )?;
        Ok(())
    }
}
