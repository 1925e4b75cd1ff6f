//! Process entry point for the loyalty-accrual backend.
//!
//! Loads configuration, opens the database pool and runs migrations,
//! wires the Store/Auth/Poller/Server together, and drives graceful
//! shutdown: a Ctrl+C/SIGTERM signal cancels a shared token, which both
//! stops the HTTP server from accepting new connections and tells the
//! Poller to exit its tick loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use app_config::AppConfig;
use auth::AuthService;
use poller::Poller;
use repository::{PgStore, Store};
use server::{AppState, Server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.level))
        .init();

    tracing::info!(address = %cfg.run_address, "starting loyalty-accrual backend");

    let pool = db::init_db_pool(&cfg).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let auth = Arc::new(AuthService::new(store.clone(), cfg.jwt_secret.clone()));

    let poller = Arc::new(Poller::new(
        store.clone(),
        cfg.accrual_system_address.clone(),
        cfg.poll_interval(),
    ));
    let poller_tx = poller.enqueue_handle();
    let shutdown = poller.cancellation_token();

    let poller_task = tokio::spawn({
        let poller = Arc::clone(&poller);
        async move { poller.run().await }
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            server::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let state = AppState {
        store,
        auth,
        poller_tx,
    };
    let server = Server::new(state, cfg.run_address.clone());
    let server_shutdown = shutdown.clone().cancelled_owned();

    server.start(server_shutdown).await?;

    if tokio::time::timeout(Duration::from_secs(5), poller_task)
        .await
        .is_err()
    {
        tracing::warn!("poller did not shut down within the grace period");
    }

    Ok(())
}
