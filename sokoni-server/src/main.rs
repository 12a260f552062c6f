//! Process entrypoint: config, database, provider client, engine wiring,
//! the auto-release actor, and the axum server with graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sokoni_engine::autorelease::AutoReleaser;
use sokoni_engine::payout::PayoutManager;
use sokoni_engine::store::pg::{PgDirectory, PgStore};
use sokoni_engine::store::{Directory, EscrowStore};
use sokoni_engine::webhook::WebhookIngester;
use sokoni_engine::{EngineConfig, EscrowManager};
use sokoni_provider::paystack::PaystackClient;
use sokoni_provider::ProviderApi;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::server::AppState;

mod config;
mod extract;
mod server;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Stdout logging; level and per-module filtering via `RUST_LOG`, INFO by
/// default.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; real deployments set the environment.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env().context("bad configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("could not connect to the database")?;

    let pg_store = PgStore::new(pool.clone());
    pg_store.migrate().await.context("migrations failed")?;
    let store: Arc<dyn EscrowStore> = Arc::new(pg_store);
    let directory: Arc<dyn Directory> = Arc::new(PgDirectory::new(pool));

    let provider: Arc<dyn ProviderApi> = match &config.provider_base_url {
        Some(base_url) => Arc::new(PaystackClient::with_config(
            config.provider_secret_key.clone(),
            config.currency.as_str().to_owned(),
            base_url.clone(),
            PROVIDER_TIMEOUT,
        )),
        None => Arc::new(PaystackClient::new(
            config.provider_secret_key.clone(),
            config.currency.as_str().to_owned(),
        )),
    };

    let manager = Arc::new(EscrowManager::new(
        store.clone(),
        directory.clone(),
        provider.clone(),
        EngineConfig {
            fee_rate: config.fee_rate,
            currency: config.currency.clone(),
            auto_release_days: config.auto_release_days,
            payment_callback_url: config.frontend_url.clone(),
        },
    ));
    let payouts = Arc::new(PayoutManager::new(store, directory, provider));
    let webhooks = Arc::new(WebhookIngester::new(
        manager.clone(),
        config.provider_secret_key.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, shutting down");
            }
            let _ = shutdown_tx.send(true);
        }
    });

    let releaser = AutoReleaser::new(
        manager.clone(),
        config.scheduler_interval,
        shutdown_rx.clone(),
    );
    let releaser_task = tokio::spawn(releaser.run());

    let app = server::router(AppState {
        manager,
        payouts,
        webhooks,
    });
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("could not bind {}", config.bind_addr))?;
    info!("listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let mut shutdown_rx = shutdown_rx;
            async move {
                // Either the flag flips or every sender is gone.
                while shutdown_rx.changed().await.is_ok() {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        })
        .await
        .context("server error")?;

    // Make sure the background actor winds down with the server.
    let _ = shutdown_tx.send(true);
    let _ = releaser_task.await;
    info!("bye");
    Ok(())
}
