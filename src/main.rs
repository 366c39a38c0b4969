// =============================================================================
// Signalgate — Main Entry Point
// =============================================================================
//
// Multi-account trading gateway: webhook signals in, exchange orders out,
// fills tracked over user-data streams plus periodic reconciliation, live
// updates pushed to browsers over SSE.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod db;
mod error;
mod exchange;
mod fills;
mod orders;
mod sse;
mod types;
mod webhook;
mod ws;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Config;
use crate::db::Database;
use crate::exchange::korea_investment::KoreaInvestmentAdapter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Signalgate — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!(env = %config.env, port = config.port, database = %config.database_url, "configuration loaded");

    if config.enable_ssl {
        // TLS terminates at the front proxy; this is operator information.
        info!(
            cert_dir = config.ssl_cert_dir.as_deref().unwrap_or("<unset>"),
            domain = config.ssl_domain.as_deref().unwrap_or("<unset>"),
            "HTTPS expected at the front proxy"
        );
    }
    if config.skip_exchange_test {
        warn!("SKIP_EXCHANGE_TEST set — startup connectivity probes disabled");
    }

    // ── 2. Database & migrations ─────────────────────────────────────────
    let db = Database::open(&config.database_url)?;
    info!("database ready");

    // ── 3. Shared state ──────────────────────────────────────────────────
    let state = AppState::new(config.clone(), db.clone());

    // ── 4. Startup connectivity probe ────────────────────────────────────
    if !config.skip_exchange_test {
        match db.active_account_markets().await {
            Ok(targets) => {
                for (account, market_type) in &targets {
                    info!(
                        account_id = account.id,
                        exchange = %account.exchange,
                        market_type = %market_type,
                        "active trading binding"
                    );
                }
                info!(count = targets.len(), "account bindings enumerated");
            }
            Err(e) => warn!(error = %e, "binding enumeration failed at startup"),
        }
    }

    // ── 5. User-data stream pool ─────────────────────────────────────────
    let pool_state = state.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = pool_state.ws_pool.sync_connections().await {
                error!(error = %e, "ws pool sync failed");
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        }
    });

    // ── 6. Reconciliation loop ───────────────────────────────────────────
    let recon_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
            recon_state.config.reconcile_interval_secs.max(1),
        ));
        loop {
            interval.tick().await;
            let targets = match recon_state.db.active_account_markets().await {
                Ok(targets) => targets,
                Err(e) => {
                    error!(error = %e, "reconciliation target enumeration failed");
                    continue;
                }
            };
            for (account, market_type) in targets {
                if let Err(e) = recon_state
                    .order_manager
                    .reconcile_account(&account, market_type)
                    .await
                {
                    // One bad account never stops the loop.
                    warn!(account_id = account.id, error = %e, "reconciliation failed");
                }
            }
        }
    });

    // ── 7. Cancel-queue worker ───────────────────────────────────────────
    let cancel_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
            cancel_state.config.cancel_queue_interval_secs.max(1),
        ));
        loop {
            interval.tick().await;
            if let Err(e) = cancel_state.cancel_worker.run_pass().await {
                warn!(error = %e, "cancel queue pass failed");
            }
        }
    });

    // ── 8. Securities token refresh job ──────────────────────────────────
    let token_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let targets = match token_state.db.active_account_markets().await {
                Ok(targets) => targets,
                Err(e) => {
                    warn!(error = %e, "token refresh enumeration failed");
                    continue;
                }
            };
            for (account, _) in targets {
                if !account.is_securities() {
                    continue;
                }
                let limiter = token_state
                    .limiters
                    .for_account(&account.exchange, account.id);
                let mut adapter = KoreaInvestmentAdapter::new(
                    account.id,
                    account.api_key.clone(),
                    account.api_secret.clone(),
                    account.is_testnet,
                    limiter,
                    token_state.db.clone(),
                );
                if let Some(number) = &account.passphrase {
                    adapter = adapter.with_account_number(number.clone());
                }
                match adapter.ensure_token().await {
                    Ok(_) => info!(account_id = account.id, "securities token verified"),
                    Err(e) => {
                        warn!(account_id = account.id, error = %e, "securities token refresh failed")
                    }
                }
            }
        }
    });

    // ── 9. HTTP server ───────────────────────────────────────────────────
    let bind_addr = format!("0.0.0.0:{}", state.config.port);
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    state.ws_pool.shutdown();
    server_handle.abort();

    info!("Signalgate shut down complete.");
    Ok(())
}
