use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{ApiEndpointConfig, DatabaseConfig, QueryConfig};

/// Raw contents of one configuration source, keyed by unique name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseConfig>,
    #[serde(default)]
    pub queries: BTreeMap<String, QueryConfig>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, ApiEndpointConfig>,
}

impl ConfigDocument {
    /// Copy mapping keys into the records' `name` fields
    pub fn with_names(mut self) -> Self {
        for (name, db) in self.databases.iter_mut() {
            db.name = name.clone();
        }
        for (name, query) in self.queries.iter_mut() {
            query.name = name.clone();
        }
        for (name, endpoint) in self.endpoints.iter_mut() {
            endpoint.name = name.clone();
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty() && self.queries.is_empty() && self.endpoints.is_empty()
    }
}

/// Read-only snapshot of every declared database, query and endpoint.
///
/// Built once by the loader and shared behind an `Arc`; a reload builds a new
/// snapshot instead of mutating this one.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigurationModel {
    databases: BTreeMap<String, DatabaseConfig>,
    queries: BTreeMap<String, QueryConfig>,
    endpoints: BTreeMap<String, ApiEndpointConfig>,
    /// Which source declared each name, for diagnostics
    #[serde(skip)]
    origins: BTreeMap<String, String>,
}

impl ConfigurationModel {
    pub(crate) fn from_parts(
        databases: BTreeMap<String, DatabaseConfig>,
        queries: BTreeMap<String, QueryConfig>,
        endpoints: BTreeMap<String, ApiEndpointConfig>,
        origins: BTreeMap<String, String>,
    ) -> Self {
        Self {
            databases,
            queries,
            endpoints,
            origins,
        }
    }

    /// Build a snapshot from a single document without going through a loader
    pub fn from_document(document: ConfigDocument) -> Self {
        let document = document.with_names();
        Self {
            databases: document.databases,
            queries: document.queries,
            endpoints: document.endpoints,
            origins: BTreeMap::new(),
        }
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseConfig> {
        self.databases.get(name)
    }

    pub fn query(&self, name: &str) -> Option<&QueryConfig> {
        self.queries.get(name)
    }

    pub fn endpoint(&self, name: &str) -> Option<&ApiEndpointConfig> {
        self.endpoints.get(name)
    }

    /// Databases in name order
    pub fn databases(&self) -> impl Iterator<Item = &DatabaseConfig> {
        self.databases.values()
    }

    pub fn queries(&self) -> impl Iterator<Item = &QueryConfig> {
        self.queries.values()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &ApiEndpointConfig> {
        self.endpoints.values()
    }

    /// Queries that run against the named database
    pub fn queries_for_database<'a>(&'a self, database: &'a str) -> impl Iterator<Item = &'a QueryConfig> + 'a {
        self.queries.values().filter(move |q| q.database == database)
    }

    /// Resolve an endpoint to its query and that query's database
    pub fn resolve_endpoint(&self, name: &str) -> Option<(&ApiEndpointConfig, &QueryConfig, &DatabaseConfig)> {
        let endpoint = self.endpoint(name)?;
        let query = self.query(&endpoint.query)?;
        let database = self.database(&query.database)?;
        Some((endpoint, query, database))
    }

    /// Source that declared the given `kind/name`, e.g. `query/list_trades`
    pub fn origin_of(&self, kind: &str, name: &str) -> Option<&str> {
        self.origins.get(&format!("{}/{}", kind, name)).map(String::as_str)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} databases, {} queries, {} endpoints",
            self.databases.len(),
            self.queries.len(),
            self.endpoints.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
databases:
  main:
    url: "sqlite::memory:"
queries:
  list_trades:
    database: main
    sql: SELECT * FROM stock_trades
endpoints:
  list-trades:
    path: /trades
    query: list_trades
"#;

    #[test]
    fn test_names_filled_from_keys() {
        let doc: ConfigDocument = serde_yaml::from_str(DOC).unwrap();
        let model = ConfigurationModel::from_document(doc);
        assert_eq!(model.database("main").unwrap().name, "main");
        assert_eq!(model.query("list_trades").unwrap().name, "list_trades");
        assert_eq!(model.endpoint("list-trades").unwrap().name, "list-trades");
    }

    #[test]
    fn test_resolve_endpoint() {
        let doc: ConfigDocument = serde_yaml::from_str(DOC).unwrap();
        let model = ConfigurationModel::from_document(doc);
        let (endpoint, query, database) = model.resolve_endpoint("list-trades").unwrap();
        assert_eq!(endpoint.query, query.name);
        assert_eq!(database.name, "main");
        assert!(model.resolve_endpoint("missing").is_none());
        assert_eq!(model.queries_for_database("main").count(), 1);
    }
}
