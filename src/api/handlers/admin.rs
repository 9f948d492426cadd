use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::services::CacheStatistics;
use crate::validation::ConfigValidator;

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub patterns: Vec<String>,
}

/// Per-database availability plus a summary of the loaded configuration
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let databases = state.connections.statuses().await;
    let status = if databases.iter().all(|db| db.available) {
        "UP"
    } else {
        "DEGRADED"
    };

    Json(json!({
        "status": status,
        "databases": databases,
        "configuration": state.config.snapshot().summary(),
        "cacheEntries": state.cache.size(),
    }))
}

/// Remove cached results matching any of the given patterns
pub async fn invalidate_cache(
    State(state): State<AppState>,
    Json(payload): Json<InvalidateRequest>,
) -> Result<Json<Value>, AppError> {
    if payload.patterns.is_empty() {
        return Err(AppError::Validation("At least one cache pattern is required".to_string()));
    }

    let removed = state.cache.invalidate(&payload.patterns)?;
    tracing::info!("Invalidated {} cache entries for {:?}", removed, payload.patterns);

    Ok(Json(json!({ "entriesInvalidated": removed })))
}

pub async fn clear_cache(State(state): State<AppState>) -> Json<Value> {
    let removed = state.cache.clear();
    tracing::info!("Cleared {} cache entries", removed);
    Json(json!({ "entriesCleared": removed }))
}

pub async fn cache_statistics(State(state): State<AppState>) -> Json<CacheStatistics> {
    Json(state.cache.statistics())
}

/// Run the chain and schema passes against the current configuration
pub async fn validation_report(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.config.snapshot();
    let chain = ConfigValidator::validate_chain(&snapshot);
    let schema = ConfigValidator::validate_schema(&snapshot, &state.connections).await;
    let result = chain.merge(&schema);

    Json(json!({
        "valid": result.is_valid(),
        "errorsByDatabase": result.errors_by_database(),
        "result": result,
    }))
}

/// Re-read every configuration source and swap the snapshot.
///
/// Pools follow the new database set and the cache is cleared. The route
/// table is fixed at startup, so newly declared endpoints are served only
/// after a restart.
pub async fn reload_configuration(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let model = state.config.reload().await?;
    state.connections.sync_with(&model).await;
    let cleared = state.cache.clear();

    Ok(Json(json!({
        "configuration": model.summary(),
        "entriesCleared": cleared,
    })))
}
