use axum::{body::Bytes, Json};
use serde_json::Value;
use std::collections::HashMap;

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{ApiEndpointConfig, PageRequest, ParameterBag, ParameterSource, QueryConfig, QueryResult};

const PAGE_PARAM: &str = "page";
const SIZE_PARAM: &str = "size";

/// Serve one configured endpoint
pub async fn handle_endpoint(
    state: AppState,
    endpoint_name: &str,
    path: HashMap<String, String>,
    query_string: HashMap<String, String>,
    body: Bytes,
) -> Result<Json<QueryResult>, AppError> {
    tracing::debug!("Request for endpoint '{}'", endpoint_name);

    let snapshot = state.config.snapshot();
    let (endpoint, query, _) = snapshot
        .resolve_endpoint(endpoint_name)
        .ok_or_else(|| AppError::NotFound(format!("Endpoint '{}' is not configured", endpoint_name)))?;

    let body = parse_body(&body)?;
    let bag = collect_parameters(endpoint, query, &path, &query_string, &body);
    let page = if endpoint.is_paginated() {
        Some(page_request(&query_string)?)
    } else {
        None
    };

    let result = state.executor.execute(endpoint_name, &bag, page).await?;
    Ok(Json(result))
}

fn parse_body(body: &Bytes) -> Result<serde_json::Map<String, Value>, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AppError::Validation("Request body must be a JSON object".to_string())),
        Err(e) => Err(AppError::Validation(format!("Invalid JSON body: {}", e))),
    }
}

/// Gather each declared parameter from its source. A name captured by the
/// path template always comes from the path.
fn collect_parameters(
    endpoint: &ApiEndpointConfig,
    query: &QueryConfig,
    path: &HashMap<String, String>,
    query_string: &HashMap<String, String>,
    body: &serde_json::Map<String, Value>,
) -> ParameterBag {
    let path_names = endpoint.path_parameters();
    let mut bag = ParameterBag::new();

    for param in &query.parameters {
        let value = if path_names.contains(&param.name.as_str()) {
            path.get(&param.name).cloned().map(Value::String)
        } else {
            match param.source {
                ParameterSource::Path => path.get(&param.name).cloned().map(Value::String),
                ParameterSource::Query => query_string.get(&param.name).cloned().map(Value::String),
                ParameterSource::Body => body.get(&param.name).cloned(),
            }
        };
        if let Some(value) = value {
            bag.insert(param.name.clone(), value);
        }
    }

    bag
}

fn page_request(query_string: &HashMap<String, String>) -> Result<PageRequest, AppError> {
    let parse = |name: &str| -> Result<Option<i64>, AppError> {
        match query_string.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| AppError::Validation(format!("'{}' must be an integer, got '{}'", name, raw))),
            None => Ok(None),
        }
    };

    Ok(PageRequest {
        page: parse(PAGE_PARAM)?,
        size: parse(SIZE_PARAM)?,
    })
}
