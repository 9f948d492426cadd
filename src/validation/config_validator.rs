// Configuration validation passes.
//
// Chain: references between endpoints, queries and databases (no I/O).
// Schema: configured SQL against the live catalog of each database.
// Endpoint: real HTTP requests against the registered routes.

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::models::{
    ConfigurationModel, HttpMethod, ParameterConfig, ParameterSource, ParameterType, QueryConfig,
    ResponseShape, SchemaCatalog, ValidationPass, ValidationReport, ValidationResult,
};
use crate::services::query_cache::KeyPattern;
use crate::services::route_registrar::RouteEntry;
use crate::services::ConnectionManager;
use crate::validation::sql_analysis::extract_references;
use crate::validation::SqlValidator;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Check that every reference resolves. Performs no I/O.
    pub fn validate_chain(model: &ConfigurationModel) -> ValidationResult {
        let mut report = ValidationReport::new(ValidationPass::Chain);

        for query in model.queries() {
            let subject = format!("query '{}'", query.name);
            if model.database(&query.database).is_none() {
                report.error(&subject, format!("references unknown database '{}'", query.database));
            } else {
                report.success(format!("query '{}' -> database '{}'", query.name, query.database));
            }

            if let Err(e) = SqlValidator::validate_single_statement(&query.sql) {
                let message = e.to_string();
                if message.contains("single statement") || message.contains("Empty SQL") {
                    report.error(&subject, message);
                } else {
                    report.warning(format!("{}: SQL not checked by the parser ({})", subject, message));
                }
            }

            for pattern in &query.invalidates {
                if let Err(e) = KeyPattern::parse(pattern) {
                    report.error(&subject, format!("invalid invalidation pattern '{}': {}", pattern, e));
                }
            }
        }

        let mut shapes: HashMap<(String, HttpMethod), String> = HashMap::new();
        for endpoint in model.endpoints() {
            let subject = format!("endpoint '{}'", endpoint.name);
            let query = match model.query(&endpoint.query) {
                Some(query) => query,
                None => {
                    report.error(&subject, format!("references unknown query '{}'", endpoint.query));
                    continue;
                }
            };
            let mut broken = model.database(&query.database).is_none();

            if endpoint.is_paginated() {
                match endpoint.count_query.as_deref() {
                    None => {
                        report.error(&subject, "is paginated but declares no count query");
                        broken = true;
                    }
                    Some(count_name) => match model.query(count_name) {
                        None => {
                            report.error(&subject, format!("references unknown count query '{}'", count_name));
                            broken = true;
                        }
                        Some(count) if count.database != query.database => {
                            report.error(
                                &subject,
                                format!(
                                    "count query '{}' runs on database '{}' but query '{}' runs on '{}'",
                                    count.name, count.database, query.name, query.database
                                ),
                            );
                            broken = true;
                        }
                        Some(_) => {}
                    },
                }
            } else if endpoint.response == ResponseShape::Paged {
                report.error(&subject, "uses the paged response shape without pagination");
                broken = true;
            }

            for name in endpoint.path_parameters() {
                if query.parameter(name).is_none() {
                    report.warning(format!(
                        "{}: path parameter '{}' is not declared by query '{}'",
                        subject, name, query.name
                    ));
                }
            }

            let shape = RouteEntry {
                method: endpoint.method,
                path: endpoint.path.clone(),
                endpoint_name: endpoint.name.clone(),
            }
            .shape();
            if let Some(first) = shapes.get(&(shape.clone(), endpoint.method)) {
                report.error(
                    &subject,
                    format!("{} {} duplicates the route of endpoint '{}'", endpoint.method, endpoint.path, first),
                );
                broken = true;
            } else {
                shapes.insert((shape, endpoint.method), endpoint.name.clone());
            }

            if !broken {
                report.success(format!(
                    "endpoint '{}' -> query '{}' -> database '{}'",
                    endpoint.name, query.name, query.database
                ));
            }
        }

        report.finish()
    }

    /// Check configured SQL against the live schema of each database.
    ///
    /// Each catalog is fetched once. A database that cannot be reached yields
    /// one error per query that runs on it.
    pub async fn validate_schema(model: &ConfigurationModel, manager: &ConnectionManager) -> ValidationResult {
        let mut report = ValidationReport::new(ValidationPass::Schema);
        let mut catalogs: BTreeMap<String, Result<SchemaCatalog, String>> = BTreeMap::new();

        for query in model.queries() {
            let subject = format!("query '{}'", query.name);
            let placeholders = SqlValidator::count_placeholders(&query.sql);
            if placeholders != query.parameters.len() {
                report.database_error(
                    &query.database,
                    &subject,
                    format!(
                        "has {} placeholders but declares {} parameters",
                        placeholders,
                        query.parameters.len()
                    ),
                );
            }

            if model.database(&query.database).is_none() {
                continue;
            }

            if !catalogs.contains_key(&query.database) {
                let catalog = Self::load_catalog(manager, &query.database).await;
                catalogs.insert(query.database.clone(), catalog);
            }
            let catalog = match catalogs.get(&query.database) {
                Some(Ok(catalog)) => catalog,
                Some(Err(reason)) => {
                    report.database_error(
                        &query.database,
                        &subject,
                        format!("cannot be checked: database '{}' is unavailable ({})", query.database, reason),
                    );
                    continue;
                }
                None => continue,
            };

            Self::check_references(&mut report, query, catalog);
        }

        report.finish()
    }

    async fn load_catalog(manager: &ConnectionManager, database: &str) -> Result<SchemaCatalog, String> {
        if !manager.is_available(database).await {
            return Err("marked as failed".to_string());
        }
        manager.catalog(database).await.map_err(|e| e.to_string())
    }

    fn check_references(report: &mut ValidationReport, query: &QueryConfig, catalog: &SchemaCatalog) {
        let subject = format!("query '{}'", query.name);
        let refs = match extract_references(&query.sql) {
            Ok(refs) => refs,
            Err(reason) => {
                report.warning(format!("{}: schema check skipped, {}", subject, reason));
                return;
            }
        };

        let mut tables = Vec::with_capacity(refs.tables.len());
        let mut missing = false;
        for name in &refs.tables {
            match catalog.table(name) {
                Some(table) => tables.push(table),
                None => {
                    report.database_error(
                        &query.database,
                        &subject,
                        format!("references non-existent table '{}'", name),
                    );
                    missing = true;
                }
            }
        }
        if missing {
            return;
        }

        let mut columns_ok = true;
        if !tables.is_empty() {
            for column in &refs.columns {
                if !tables.iter().any(|t| t.has_column(column)) {
                    report.database_error(
                        &query.database,
                        &subject,
                        format!("references non-existent column '{}'", column),
                    );
                    columns_ok = false;
                }
            }
        }

        if columns_ok {
            report.success(format!("{} matches the schema of database '{}'", subject, query.database));
        }
    }

    /// Call every registered route once over HTTP with sample parameters
    pub async fn validate_endpoints(
        model: &ConfigurationModel,
        routes: &[RouteEntry],
        base_url: &str,
        timeout: Duration,
    ) -> ValidationResult {
        let mut report = ValidationReport::new(ValidationPass::Endpoint);
        let client = match reqwest::Client::builder().timeout(timeout).no_proxy().build() {
            Ok(client) => client,
            Err(e) => {
                report.error("endpoint validation", format!("cannot build HTTP client: {}", e));
                return report.finish();
            }
        };

        for route in routes {
            let subject = format!("endpoint '{}'", route.endpoint_name);
            let parameters = model
                .endpoint(&route.endpoint_name)
                .and_then(|endpoint| model.query(&endpoint.query))
                .map(|query| query.parameters.as_slice())
                .unwrap_or_default();

            let (path, query_string, body) = Self::sample_request(&route.path, parameters);
            let url = format!("{}{}", base_url.trim_end_matches('/'), path);
            let method = match route.method {
                HttpMethod::Get => reqwest::Method::GET,
                HttpMethod::Post => reqwest::Method::POST,
                HttpMethod::Put => reqwest::Method::PUT,
                HttpMethod::Patch => reqwest::Method::PATCH,
                HttpMethod::Delete => reqwest::Method::DELETE,
            };

            let mut request = client.request(method, &url).query(&query_string);
            if !body.is_empty() {
                request = request.json(&body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status.is_redirection() {
                        report.success(format!("{} {} answered {}", route.method, path, status.as_u16()));
                    } else if status.is_client_error() {
                        report.warning(format!(
                            "{}: {} {} answered {} to sample parameters",
                            subject,
                            route.method,
                            path,
                            status.as_u16()
                        ));
                    } else {
                        report.error(&subject, format!("{} {} answered {}", route.method, path, status.as_u16()));
                    }
                }
                Err(e) if e.is_timeout() => {
                    report.error(&subject, format!("{} {} timed out after {:?}", route.method, path, timeout));
                }
                Err(e) => {
                    report.error(&subject, format!("{} {} failed: {}", route.method, path, e));
                }
            }
        }

        report.finish()
    }

    /// Fill the path template and split the remaining sample values into the
    /// query string and the JSON body
    fn sample_request(
        template: &str,
        parameters: &[ParameterConfig],
    ) -> (String, Vec<(String, String)>, serde_json::Map<String, Value>) {
        let mut path = template.to_string();
        let mut query_string = Vec::new();
        let mut body = serde_json::Map::new();

        for param in parameters {
            let value = Self::sample_value(param);
            let placeholder = format!("{{{}}}", param.name);
            if path.contains(&placeholder) {
                let text = value_text(&value);
                let encoded: String = url::form_urlencoded::byte_serialize(text.as_bytes()).collect();
                path = path.replace(&placeholder, &encoded);
                continue;
            }
            match param.source {
                ParameterSource::Path | ParameterSource::Query => {
                    query_string.push((param.name.clone(), value_text(&value)));
                }
                ParameterSource::Body => {
                    body.insert(param.name.clone(), value);
                }
            }
        }

        (path, query_string, body)
    }

    /// The declared example, else the default, else a value of the right type
    pub fn sample_value(param: &ParameterConfig) -> Value {
        if let Some(example) = param.example.as_ref().or(param.default_value.as_ref()) {
            return example.clone();
        }
        match param.param_type {
            ParameterType::String => json!("sample"),
            ParameterType::Integer | ParameterType::Long => json!(1),
            ParameterType::Double => json!(1.0),
            ParameterType::Boolean => json!(true),
            ParameterType::Date => json!("2024-01-01"),
            ParameterType::Timestamp => json!("2024-01-01T00:00:00"),
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
