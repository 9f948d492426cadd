use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    routing::{delete, get, on, post, MethodFilter},
    Router,
};
use std::collections::HashMap;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{admin, endpoint, AppState};
use crate::models::HttpMethod;
use crate::services::route_registrar::RouteEntry;

fn method_filter(method: HttpMethod) -> MethodFilter {
    match method {
        HttpMethod::Get => MethodFilter::GET,
        HttpMethod::Post => MethodFilter::POST,
        HttpMethod::Put => MethodFilter::PUT,
        HttpMethod::Patch => MethodFilter::PATCH,
        HttpMethod::Delete => MethodFilter::DELETE,
    }
}

/// Build the router: fixed admin routes plus one route per registerable
/// endpoint, each handler bound to its endpoint name.
///
/// `routes` must already be sorted and free of collisions.
pub fn create_router(state: AppState, routes: &[RouteEntry]) -> Router {
    let mut router = Router::new()
        .route("/health", get(admin::health))
        .route("/api/cache", delete(admin::clear_cache))
        .route("/api/cache/invalidate", post(admin::invalidate_cache))
        .route("/api/cache/statistics", get(admin::cache_statistics))
        .route("/api/validation", get(admin::validation_report))
        .route("/api/config/reload", post(admin::reload_configuration));

    for route in routes {
        let name = route.endpoint_name.clone();
        let filter = method_filter(route.method);

        router = if route.parameter_count() > 0 {
            router.route(
                &route.path,
                on(
                    filter,
                    move |State(state): State<AppState>,
                          Path(path): Path<HashMap<String, String>>,
                          Query(query): Query<HashMap<String, String>>,
                          body: Bytes| {
                        let name = name.clone();
                        async move { endpoint::handle_endpoint(state, &name, path, query, body).await }
                    },
                ),
            )
        } else {
            router.route(
                &route.path,
                on(
                    filter,
                    move |State(state): State<AppState>, Query(query): Query<HashMap<String, String>>, body: Bytes| {
                        let name = name.clone();
                        async move { endpoint::handle_endpoint(state, &name, HashMap::new(), query, body).await }
                    },
                ),
            )
        };

        tracing::info!("Registered {} {} -> endpoint '{}'", route.method, route.path, route.endpoint_name);
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConfigDocument, ConfigurationModel};
    use crate::services::config_loader::ConfigHandle;
    use crate::services::{ConnectionManager, QueryResultCache};
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app() -> Router {
        let doc: ConfigDocument = serde_yaml::from_str(
            r#"
databases:
  main:
    url: "sqlite::memory:"
queries:
  echo:
    database: main
    sql: SELECT ? AS symbol
    parameters:
      - name: symbol
        required: true
endpoints:
  echo:
    path: /api/echo/{symbol}
    query: echo
  echo-query:
    path: /api/echo
    query: echo
"#,
        )
        .unwrap();
        let model = ConfigurationModel::from_document(doc);
        let connections = Arc::new(ConnectionManager::new(Duration::from_secs(60)));
        connections.initialize(&model).await;

        let routes = crate::services::route_registrar::registerable_endpoints(&model, &connections).await;
        let state = AppState::new(
            Arc::new(ConfigHandle::from_model(model)),
            connections,
            Arc::new(QueryResultCache::new(16)),
        );
        create_router(state, &routes)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_path_and_query_parameters() {
        let app = app().await;

        let response = app
            .clone()
            .oneshot(Request::get("/api/echo/AAPL").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["type"], "SIMPLE");
        assert_eq!(json["data"][0]["symbol"], "AAPL");

        let response = app
            .oneshot(Request::get("/api/echo?symbol=MSFT").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["data"][0]["symbol"], "MSFT");
    }

    #[tokio::test]
    async fn test_error_body() {
        let app = app().await;
        let response = app
            .oneshot(Request::get("/api/echo").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_health_and_wrong_method() {
        let app = app().await;
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "UP");
        assert_eq!(json["databases"][0]["name"], "main");

        let response = app
            .oneshot(Request::post("/api/echo/AAPL").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
