use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use shelfrec_api::api::{create_router, AppState};
use shelfrec_api::config::Config;
use shelfrec_api::services::{spawn_daily_sweep, spawn_refresh_worker, RecommendationEngine};
use shelfrec_api::store::{postgres, Stores};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let pool = postgres::create_pool(&config.database_url).await?;
    sqlx::migrate!().run(&pool).await?;
    let stores = Stores::postgres(pool);

    let engine = Arc::new(RecommendationEngine::new(
        stores.clone(),
        config.recommender_params(),
    ));
    let (refresh, worker) = spawn_refresh_worker(engine.clone());
    spawn_daily_sweep(engine, config.sweep_hour);

    let state = AppState::new(stores, refresh);
    let app = create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flush any refreshes that were queued before the signal.
    worker.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
