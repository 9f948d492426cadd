use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod api;
mod config;
mod models;
mod services;
mod storage;
mod validation;

use api::handlers::AppState;
use config::{Settings, ValidationMode};
use services::config_loader::{ConfigHandle, ConfigurationLoader, SqliteStoreSource, YamlFileSource};
use services::route_registrar::registerable_endpoints;
use services::{ConnectionManager, QueryResultCache};
use storage::ConfigStore;
use validation::ConfigValidator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("Failed to load engine settings")?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&settings.logging.level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut loader = ConfigurationLoader::new();
    for path in &settings.sources.paths {
        loader.add_source(Box::new(YamlFileSource::new(path.clone())));
    }
    if let Some(store_path) = &settings.sources.store_path {
        let store = ConfigStore::new(store_path)
            .await
            .with_context(|| format!("Failed to open configuration store {}", store_path))?;
        loader.add_source(Box::new(SqliteStoreSource::new(Arc::new(store), store_path.clone())));
    }
    info!("Loading configuration from {:?}", loader.source_names());

    let config = Arc::new(ConfigHandle::load(loader).await.map_err(|e| {
        error!("{}", e);
        e
    })?);
    let model = config.snapshot();
    info!("Configuration loaded: {}", model.summary());

    let connections = Arc::new(ConnectionManager::new(settings.health.recheck_interval()));
    connections.initialize(&model).await;

    let chain = ConfigValidator::validate_chain(&model);
    let schema = ConfigValidator::validate_schema(&model, &connections).await;
    let report = chain.merge(&schema);
    report.log();

    match settings.validation.mode {
        ValidationMode::ValidateOnly => {
            let code = if report.is_valid() { 0 } else { 1 };
            info!("Validate-only mode, exiting with status {}", code);
            std::process::exit(code);
        }
        ValidationMode::FailFast if !report.is_valid() => {
            anyhow::bail!("Configuration has {} validation error(s)", report.errors().len());
        }
        _ => {}
    }

    let routes = registerable_endpoints(&model, &connections).await;

    let cache = Arc::new(QueryResultCache::new(settings.cache.max_entries));
    if settings.cache.sweep_interval_secs > 0 {
        cache.spawn_sweeper(Duration::from_secs(settings.cache.sweep_interval_secs));
    }
    if settings.health.monitor_interval_secs > 0 {
        connections.spawn_health_monitor(Duration::from_secs(settings.health.monitor_interval_secs));
    }

    let state = AppState::new(config.clone(), connections.clone(), cache);
    let app = api::routes::create_router(state, &routes);

    let addr: SocketAddr = settings
        .server_address()
        .parse()
        .with_context(|| format!("Invalid server address {}", settings.server_address()))?;
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let local = listener.local_addr()?;
    info!("Server listening on {} with {} dynamic routes", local, routes.len());

    if settings.validation.endpoint_check {
        let base_url = format!("http://127.0.0.1:{}", local.port());
        let timeout = settings.validation.endpoint_timeout();
        let model = model.clone();
        tokio::spawn(async move {
            let result = ConfigValidator::validate_endpoints(&model, &routes, &base_url, timeout).await;
            result.log();
            if !result.is_valid() {
                warn!("{} endpoint(s) failed the connectivity check", result.errors().len());
            }
        });
    }

    axum::serve(listener, app).await?;

    Ok(())
}
