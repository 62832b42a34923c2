mod api;
mod config;
mod db;
mod dispatcher;
mod error;
mod factory;
mod models;
mod runner;
mod sources;
mod state;
mod store;
mod webhook_types;

use crate::config::Config;
use crate::runner::Runner;
use crate::sources::{SystemClock, ThreadRandom};
use crate::state::AppState;
use crate::store::SqliteStore;
use anyhow::Result;
use moka::future::Cache;
use regex::Regex;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Arc::new(Config::new()?);

    let pool = if config.database.url == "sqlite::memory:" {
        db::init_memory_db().await?
    } else {
        db::init_db(&config.database.url, config.database.max_connections.unwrap_or(5)).await?
    };
    let store = Arc::new(SqliteStore::new(pool));

    let branch_filter = match &config.simulator.branch_filter_regex {
        Some(re) => match Regex::new(re) {
            Ok(r) => Some(r),
            Err(e) => {
                error!("Invalid branch filter regex, accepting all branches: {}", e);
                None
            }
        },
        None => None,
    };

    let time_scale = config.simulator.time_scale.unwrap_or(1.0);
    let clock = Arc::new(SystemClock::new(time_scale));
    let random = Arc::new(ThreadRandom);
    let settings = config.simulator.runner_settings();
    info!(
        "Simulating jobs of {}..{}s at time scale {}, failure threshold {}",
        settings.min_duration_seconds,
        settings.min_duration_seconds + settings.duration_span_seconds - 1,
        time_scale,
        settings.failure_threshold
    );
    let runner = Arc::new(Runner::new(store.clone(), clock.clone(), random.clone(), settings));

    let ttl = config.cache.ttl_seconds.unwrap_or(5);
    let capacity = config.cache.capacity.unwrap_or(1_000);

    let (dispatcher, queue) = dispatcher::channel();
    let state = AppState {
        store,
        dispatcher,
        clock,
        random,
        branch_filter,
        cache: Cache::builder()
            .time_to_live(std::time::Duration::from_secs(ttl))
            .max_capacity(capacity)
            .build(),
    };

    // Start dispatch loop in background
    tokio::spawn(async move {
        dispatcher::start_dispatch_loop(runner, queue).await;
    });

    // Start Web Server
    let app = api::app_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server running on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
