use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tower::ServiceExt;

use dyn_api_backend::api::handlers::AppState;
use dyn_api_backend::api::middleware::AppError;
use dyn_api_backend::api::routes::create_router;
use dyn_api_backend::models::{BoundValue, PageRequest, ParameterBag};
use dyn_api_backend::services::config_loader::{ConfigHandle, ConfigurationLoader, YamlTextSource};
use dyn_api_backend::services::route_registrar::{registerable_endpoints, RouteEntry};
use dyn_api_backend::services::{ConnectionManager, QueryResultCache};
use dyn_api_backend::validation::ConfigValidator;

const DATABASES: &str = r#"
databases:
  trades:
    url: "sqlite::memory:"
    pool:
      acquire_timeout_ms: 500
  analytics:
    url: "sqlite:/nonexistent-dir/for/sure/analytics.db"
"#;

const API: &str = r#"
queries:
  get_trades_by_symbol:
    database: trades
    sql: SELECT id, symbol, price FROM stock_trades WHERE symbol = ? ORDER BY id
    parameters:
      - name: symbol
        required: true
        example: AAPL
    cache:
      ttl_seconds: 300
  list_trades:
    database: trades
    sql: SELECT id, symbol, price FROM stock_trades ORDER BY id
    cache:
      ttl_seconds: 300
  count_trades:
    database: trades
    sql: SELECT COUNT(*) AS total FROM stock_trades
  daily_volume:
    database: analytics
    sql: SELECT day, volume FROM daily_volume
endpoints:
  trades-by-symbol:
    path: /api/trades/{symbol}
    query: get_trades_by_symbol
  list-trades:
    path: /api/trades
    query: list_trades
    count_query: count_trades
    pagination:
      default_size: 20
      max_size: 100
    response: paged
  daily-volume:
    path: /api/volume
    query: daily_volume
"#;

async fn engine(seed_trades: bool) -> (AppState, Vec<RouteEntry>) {
    let loader = ConfigurationLoader::new()
        .with_source(YamlTextSource::new("databases.yaml", DATABASES))
        .with_source(YamlTextSource::new("api.yaml", API));
    let config = Arc::new(assert_ok!(ConfigHandle::load(loader).await));
    let model = config.snapshot();

    let connections = Arc::new(ConnectionManager::new(Duration::from_secs(60)));
    connections.initialize(&model).await;

    if seed_trades {
        let mut session = connections.acquire("trades").await.unwrap();
        session
            .execute("CREATE TABLE stock_trades (id INTEGER PRIMARY KEY, symbol TEXT NOT NULL, price REAL)", &[])
            .await
            .unwrap();
        for i in 0..45 {
            let symbol = ["AAPL", "MSFT", "GOOG"][i % 3];
            session
                .execute(
                    "INSERT INTO stock_trades (symbol, price) VALUES (?, ?)",
                    &[BoundValue::Text(symbol.into()), BoundValue::Double(10.0 + i as f64)],
                )
                .await
                .unwrap();
        }
    }

    let routes = registerable_endpoints(&model, &connections).await;
    let state = AppState::new(config, connections, Arc::new(QueryResultCache::new(1000)));
    (state, routes)
}

fn bag(symbol: &str) -> ParameterBag {
    ParameterBag::from([("symbol".to_string(), json!(symbol))])
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_failed_database_is_isolated() {
    let (state, routes) = engine(true).await;

    let paths: Vec<&str> = routes.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["/api/trades", "/api/trades/{symbol}"]);
    assert!(!state.connections.is_available("analytics").await);

    let result = assert_ok!(state.executor.execute("trades-by-symbol", &bag("AAPL"), None).await);
    assert_eq!(result.data().len(), 15);

    let err = assert_err!(state.executor.execute("daily-volume", &ParameterBag::new(), None).await);
    assert!(matches!(err, AppError::DatabaseUnavailable { ref database, .. } if database == "analytics"));
}

#[tokio::test]
async fn test_cache_idempotence_and_targeted_invalidation() {
    let (state, _) = engine(true).await;
    let executor = &state.executor;

    let first = executor.execute("trades-by-symbol", &bag("AAPL"), None).await.unwrap();
    let again = executor.execute("trades-by-symbol", &bag("AAPL"), None).await.unwrap();
    assert!(!first.is_cached());
    assert!(again.is_cached());
    assert_eq!(first.data(), again.data());

    executor.execute("trades-by-symbol", &bag("MSFT"), None).await.unwrap();
    assert_eq!(state.cache.entries_for("get_trades_by_symbol"), 2);

    let removed = state.cache.invalidate(&["get_trades_by_symbol:symbol=AAPL:*"]).unwrap();
    assert_eq!(removed, 1);

    assert!(!executor.execute("trades-by-symbol", &bag("AAPL"), None).await.unwrap().is_cached());
    assert!(executor.execute("trades-by-symbol", &bag("MSFT"), None).await.unwrap().is_cached());

    let stats = state.cache.statistics();
    assert_eq!(stats.overall.total_hits, 2);
    assert_eq!(stats.overall.total_misses, 3);
}

#[tokio::test]
async fn test_pagination_over_http() {
    let (state, routes) = engine(true).await;
    let app = create_router(state, &routes);

    for (page, has_next, rows) in [(0, true, 20), (1, true, 20), (2, false, 5)] {
        let (status, body) = get_json(&app, &format!("/api/trades?page={}&size=20", page)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "PAGED");
        assert_eq!(body["pagination"]["totalElements"], 45);
        assert_eq!(body["pagination"]["totalPages"], 3);
        assert_eq!(body["pagination"]["hasNext"], has_next);
        assert_eq!(body["pagination"]["hasPrevious"], page > 0);
        assert_eq!(body["data"].as_array().unwrap().len(), rows);
    }

    let (status, body) = get_json(&app, "/api/trades?page=-1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = get_json(&app, "/api/trades?page=9223372036854775807").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_page_size_defaults_and_clamps() {
    let (state, _) = engine(true).await;

    let default_page = state.executor.execute("list-trades", &ParameterBag::new(), None).await.unwrap();
    assert_eq!(default_page.pagination().unwrap().size, 20);

    let clamped = state
        .executor
        .execute("list-trades", &ParameterBag::new(), Some(PageRequest::new(0, 0)))
        .await
        .unwrap();
    assert_eq!(clamped.pagination().unwrap().size, 1);
    assert_eq!(clamped.pagination().unwrap().total_pages, 45);
}

#[tokio::test]
async fn test_schema_validation_reports_missing_table_once() {
    let (state, _) = engine(false).await;
    let model = state.config.snapshot();

    let result = ConfigValidator::validate_schema(&model, &state.connections).await;
    let missing: Vec<_> = result
        .errors()
        .iter()
        .filter(|e| e.subject == "query 'get_trades_by_symbol'")
        .collect();
    assert_eq!(missing.len(), 1);
    assert!(missing[0].message.contains("non-existent table 'stock_trades'"));

    let grouped = result.errors_by_database();
    assert_eq!(grouped.get("analytics").map(Vec::len), Some(1));

    let chain = ConfigValidator::validate_chain(&model);
    assert!(chain.is_valid());
    assert!(!chain.merge(&result).is_valid());
}

#[tokio::test]
async fn test_cache_admin_routes() {
    let (state, routes) = engine(true).await;
    let app = create_router(state, &routes);

    get_json(&app, "/api/trades/AAPL").await;
    let (_, cached) = get_json(&app, "/api/trades/AAPL").await;
    assert_eq!(cached["cached"], true);

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/cache/invalidate")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"patterns": ["get_trades_by_symbol:*"]}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["entriesInvalidated"], 1);

    let (_, stats) = get_json(&app, "/api/cache/statistics").await;
    assert_eq!(stats["overall"]["totalHits"], 1);
    assert!(stats["perQuery"]["get_trades_by_symbol"].is_object());

    let (_, health) = get_json(&app, "/health").await;
    assert_eq!(health["status"], "DEGRADED");
}

#[tokio::test]
async fn test_duplicate_names_across_sources_rejected() {
    let loader = ConfigurationLoader::new()
        .with_source(YamlTextSource::new("databases.yaml", DATABASES))
        .with_source(YamlTextSource::new("api.yaml", API))
        .with_source(YamlTextSource::new(
            "extra.yaml",
            "queries:\n  list_trades:\n    database: trades\n    sql: SELECT 1\n",
        ));

    let err = assert_err!(loader.load().await);
    assert!(matches!(err, AppError::ConfigLoad(ref m) if m.contains("list_trades") && m.contains("extra.yaml")));
}
