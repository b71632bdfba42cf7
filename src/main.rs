//! Marketsync server
//!
//! Loads the provider catalog, prepares the store and serves the sync API.

use anyhow::Context;
use std::net::SocketAddr;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketsync::catalog::Catalog;
use marketsync::config::Config;
use marketsync::db::{self, UpsertGateway};
use marketsync::routes;
use marketsync::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketsync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Marketsync v{}", env!("CARGO_PKG_VERSION"));

    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let catalog = Catalog::load(&config.sync.catalog)
        .with_context(|| format!("Failed to load catalog {}", config.sync.catalog.display()))?;
    tracing::info!(
        providers = catalog.providers.len(),
        entities = catalog.entities.len(),
        clients = catalog.clients.len(),
        "Catalog loaded"
    );

    let gateway = UpsertGateway::new(db_pool.clone(), config.store_policy());
    let orchestrator = catalog.build_orchestrator(gateway, config.sync_settings())?;
    orchestrator
        .prepare()
        .await
        .context("Failed to prepare entity tables")?;

    let app_state = AppState::new(db_pool, orchestrator, catalog.clients);
    let app = routes::app(app_state);

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid SERVER_HOST {}", config.server.host))?;
    let addr = SocketAddr::from((host, config.server.port));
    tracing::info!("Marketsync listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
