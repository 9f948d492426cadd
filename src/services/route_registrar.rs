use serde::Serialize;
use std::collections::HashMap;

use crate::models::{path_template_parameters, ConfigurationModel, HttpMethod};
use crate::services::ConnectionManager;

/// Paths served by the engine itself; configured endpoints may not shadow them
pub const RESERVED_PATHS: [&str; 6] = [
    "/health",
    "/api/cache",
    "/api/config/reload",
    "/api/cache/invalidate",
    "/api/cache/statistics",
    "/api/validation",
];

/// One route the HTTP layer should register
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub method: HttpMethod,
    pub path: String,
    pub endpoint_name: String,
}

impl RouteEntry {
    pub fn parameter_count(&self) -> usize {
        path_template_parameters(&self.path).len()
    }

    /// Characters of the path outside `{param}` segments
    pub fn literal_length(&self) -> usize {
        self.path
            .split('/')
            .filter(|segment| !segment.starts_with('{'))
            .map(str::len)
            .sum()
    }

    /// The path with every parameter name erased; two templates with the
    /// same shape match the same requests
    pub fn shape(&self) -> String {
        template_shape(&self.path)
    }
}

fn template_shape(path: &str) -> String {
    path.split('/')
        .map(|segment| if segment.starts_with('{') { "{}" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

/// Check that every segment is either literal or a whole `{name}` capture
fn is_routable(path: &str) -> bool {
    path.starts_with('/')
        && path.split('/').skip(1).all(|segment| {
            match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => {
                    let name = name.strip_prefix('*').unwrap_or(name);
                    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                }
                None => !segment.contains('{') && !segment.contains('}'),
            }
        })
}

/// Order routes so the most specific templates come first
pub fn sort_routes(routes: &mut [RouteEntry]) {
    routes.sort_by(|a, b| {
        a.parameter_count()
            .cmp(&b.parameter_count())
            .then_with(|| b.literal_length().cmp(&a.literal_length()))
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.method.cmp(&b.method))
    });
}

/// Drop routes the router could not hold together: a repeated method on the
/// same template shape, or a second spelling of a shape already taken.
/// Earlier routes win.
pub fn dedupe_routes(routes: Vec<RouteEntry>) -> Vec<RouteEntry> {
    let mut templates: HashMap<String, (String, String)> = HashMap::new();
    let mut taken: HashMap<(String, HttpMethod), String> = HashMap::new();
    let mut kept = Vec::with_capacity(routes.len());

    for route in routes {
        let shape = route.shape();

        if let Some((template, owner)) = templates.get(&shape) {
            if template != &route.path {
                tracing::warn!(
                    "Skipping endpoint '{}': path {} conflicts with {} of endpoint '{}'",
                    route.endpoint_name,
                    route.path,
                    template,
                    owner
                );
                continue;
            }
        }

        if let Some(owner) = taken.get(&(shape.clone(), route.method)) {
            tracing::warn!(
                "Skipping endpoint '{}': {} {} is already served by endpoint '{}'",
                route.endpoint_name,
                route.method,
                route.path,
                owner
            );
            continue;
        }

        templates
            .entry(shape.clone())
            .or_insert_with(|| (route.path.clone(), route.endpoint_name.clone()));
        taken.insert((shape, route.method), route.endpoint_name.clone());
        kept.push(route);
    }

    kept
}

/// Endpoints that can be served right now: their query and database resolve
/// and the database is available. Sorted and free of collisions.
pub async fn registerable_endpoints(model: &ConfigurationModel, manager: &ConnectionManager) -> Vec<RouteEntry> {
    let mut routes = Vec::new();

    for endpoint in model.endpoints() {
        let Some((_, query, database)) = model.resolve_endpoint(&endpoint.name) else {
            tracing::warn!(
                "Skipping endpoint '{}': query '{}' or its database is not configured",
                endpoint.name,
                endpoint.query
            );
            continue;
        };

        if !is_routable(&endpoint.path) {
            tracing::warn!("Skipping endpoint '{}': invalid path template {}", endpoint.name, endpoint.path);
            continue;
        }

        if RESERVED_PATHS.contains(&endpoint.path.as_str()) {
            tracing::warn!("Skipping endpoint '{}': path {} is reserved", endpoint.name, endpoint.path);
            continue;
        }

        if let Some(count_name) = endpoint.count_query.as_deref().filter(|_| endpoint.is_paginated()) {
            let Some(count_query) = model.query(count_name) else {
                tracing::warn!(
                    "Skipping endpoint '{}': count query '{}' is not configured",
                    endpoint.name,
                    count_name
                );
                continue;
            };
            if !manager.is_available(&count_query.database).await {
                tracing::warn!(
                    "Skipping endpoint '{}': database '{}' for count query '{}' is unavailable",
                    endpoint.name,
                    count_query.database,
                    count_name
                );
                continue;
            }
        }

        if !manager.is_available(&database.name).await {
            tracing::warn!(
                "Skipping endpoint '{}': database '{}' for query '{}' is unavailable",
                endpoint.name,
                database.name,
                query.name
            );
            continue;
        }

        routes.push(RouteEntry {
            method: endpoint.method,
            path: endpoint.path.clone(),
            endpoint_name: endpoint.name.clone(),
        });
    }

    sort_routes(&mut routes);
    let routes = dedupe_routes(routes);
    tracing::info!("{} of {} endpoints are registerable", routes.len(), model.endpoints().count());
    routes
}
