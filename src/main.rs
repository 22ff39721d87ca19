use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wa_fleet::config::Config;
use wa_fleet::coordinator::FleetCoordinator;
use wa_fleet::handlers;
use wa_fleet::protocol::MemoryProtocol;
use wa_fleet::registry::{InstanceRegistry, MemoryRegistry, PostgresRegistry};
use wa_fleet::session_store::{MemorySessionRepo, PostgresSessionRepo, SessionRepo, SessionStore};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env();
    info!(
        port = config.port,
        max_instances = config.max_instances,
        boot_delay_ms = config.staggered_boot_delay.as_millis() as u64,
        retention_days = config.messages_retention_days,
        database = config.database_url.is_some(),
        "starting wa-fleet"
    );

    let (registry, session_repo): (Arc<dyn InstanceRegistry>, Arc<dyn SessionRepo>) =
        match config.database_url.as_deref() {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .connect(url)
                    .await
                    .context("failed to connect to the database")?;
                sqlx::migrate!()
                    .run(&pool)
                    .await
                    .context("failed to run migrations")?;
                (
                    Arc::new(PostgresRegistry::new(pool.clone())),
                    Arc::new(PostgresSessionRepo::new(pool)),
                )
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory stores (state is lost on exit)");
                (MemoryRegistry::new(), MemorySessionRepo::new())
            }
        };

    let sessions = Arc::new(SessionStore::new(session_repo, config.key_write_debounce));
    // The wire transport is provided by an out-of-tree adapter; without one
    // the in-memory protocol keeps the control plane fully operational.
    let protocol = Arc::new(MemoryProtocol::new());
    let coordinator = FleetCoordinator::new(config.clone(), registry, sessions, protocol);

    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(err) = coordinator.recover().await {
                warn!(error = %err, "boot recovery did not complete");
            }
        });
    }

    let app = handlers::router(coordinator.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("wa-fleet listening on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!("shutdown signal received; flushing fleet");
    coordinator.shutdown().await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
