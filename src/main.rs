//! DEMPER — concurrent marketplace repricing engine.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the database, wires the engine together, and runs rounds until
//! Ctrl+C. A round in flight always finishes before shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use demper::config;
use demper::dashboard;
use demper::engine::{CatalogSync, Orchestrator, OrchestratorSettings, Repricer, RepricerSettings, StatusBoard};
use demper::marketplace::{KaspiClient, Marketplace};
use demper::proxy::ProxySelector;
use demper::session::{CommandRefresher, CredentialRefresher, SessionStore, UnconfiguredRefresher};
use demper::storage::Database;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("DEMPER_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    let instance = Uuid::new_v4();
    info!(
        %instance,
        config = %config_path,
        max_concurrent = cfg.engine.max_concurrent_tasks,
        round_delay_secs = cfg.engine.round_delay_secs,
        "DEMPER starting up"
    );

    // -- Initialise components -------------------------------------------

    let db = Database::connect(&cfg.database.url, cfg.database.max_connections)
        .await
        .context("Failed to open database")?;
    db.init_schema().await.context("Failed to initialise schema")?;

    let proxies = Arc::new(ProxySelector::from_config(&cfg.proxy)?);
    if proxies.is_enabled() {
        info!(pool = proxies.pool_size(), "Proxy rotation enabled");
    }

    let marketplace: Arc<dyn Marketplace> = Arc::new(KaspiClient::new(
        cfg.marketplace.clone(),
        proxies.clone(),
        cfg.engine.request_timeout(),
    ));

    let refresher: Arc<dyn CredentialRefresher> = match CommandRefresher::from_config(&cfg.session) {
        Some(r) => Arc::new(r),
        None => {
            warn!("No session.refresh_command configured, expired sessions cannot be renewed");
            Arc::new(UnconfiguredRefresher)
        }
    };

    let sessions = Arc::new(SessionStore::new(db.clone(), marketplace.clone(), refresher));
    let repricer = Arc::new(Repricer::new(
        db.clone(),
        marketplace.clone(),
        sessions.clone(),
        RepricerSettings::from_config(&cfg.engine),
    ));
    let catalog = Arc::new(CatalogSync::new(db.clone(), marketplace, sessions.clone()));
    let status = Arc::new(StatusBoard::new());

    let orchestrator = Orchestrator::new(
        db.clone(),
        repricer,
        catalog,
        sessions,
        status.clone(),
        OrchestratorSettings::from_config(&cfg.engine),
    );

    if cfg.dashboard.enabled {
        dashboard::spawn_dashboard(status, cfg.dashboard.port);
    }

    // -- Main loop -------------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, finishing current round"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    info!("Entering main loop. Press Ctrl+C to stop.");
    let result = orchestrator.run(shutdown_rx).await;

    let proxy_stats = proxies.stats();
    info!(
        proxy_requests = proxy_stats.total_requests,
        "DEMPER shutting down"
    );
    db.close().await;

    result.context("Engine stopped on a fatal error")
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("demper=info"));

    let json_logging = std::env::var("DEMPER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
