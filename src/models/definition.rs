// Declarative configuration records: databases, queries, endpoints
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection pool sizing for one database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "PoolSettings::default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "PoolSettings::default_min_connections")]
    pub min_connections: usize,
    #[serde(default = "PoolSettings::default_acquire_timeout_ms", alias = "connection_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "PoolSettings::default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl PoolSettings {
    fn default_max_connections() -> usize {
        (num_cpus::get() * 2).clamp(4, 32)
    }

    fn default_min_connections() -> usize {
        1
    }

    fn default_acquire_timeout_ms() -> u64 {
        5_000
    }

    fn default_query_timeout_secs() -> u64 {
        30
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: Self::default_max_connections(),
            min_connections: Self::default_min_connections(),
            acquire_timeout_ms: Self::default_acquire_timeout_ms(),
            query_timeout_secs: Self::default_query_timeout_secs(),
        }
    }
}

/// A named database connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Filled from the mapping key when declared in YAML
    #[serde(default)]
    pub name: String,
    #[serde(alias = "connection_url")]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Driver identifier; inferred from the URL scheme when absent
    #[serde(default, alias = "type")]
    pub driver: Option<String>,
    #[serde(default)]
    pub pool: PoolSettings,
}

/// Declared type of a query parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParameterType {
    #[serde(alias = "string", alias = "text")]
    String,
    #[serde(alias = "integer", alias = "int")]
    Integer,
    #[serde(alias = "long", alias = "bigint")]
    Long,
    #[serde(alias = "double", alias = "float", alias = "decimal")]
    Double,
    #[serde(alias = "boolean", alias = "bool")]
    Boolean,
    #[serde(alias = "date")]
    Date,
    #[serde(alias = "timestamp", alias = "datetime")]
    Timestamp,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterType::String => "STRING",
            ParameterType::Integer => "INTEGER",
            ParameterType::Long => "LONG",
            ParameterType::Double => "DOUBLE",
            ParameterType::Boolean => "BOOLEAN",
            ParameterType::Date => "DATE",
            ParameterType::Timestamp => "TIMESTAMP",
        };
        f.write_str(name)
    }
}

/// Where the HTTP layer reads a parameter from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParameterSource {
    #[serde(alias = "path")]
    Path,
    #[default]
    #[serde(alias = "query")]
    Query,
    #[serde(alias = "body")]
    Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfig {
    pub name: String,
    #[serde(rename = "type", default = "ParameterConfig::default_type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub source: ParameterSource,
    #[serde(default)]
    pub required: bool,
    #[serde(default, alias = "default", alias = "defaultValue")]
    pub default_value: Option<serde_json::Value>,
    /// Sample value used when probing endpoints
    #[serde(default)]
    pub example: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ParameterConfig {
    fn default_type() -> ParameterType {
        ParameterType::String
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default = "CachePolicy::default_enabled")]
    pub enabled: bool,
    #[serde(default = "CachePolicy::default_ttl_seconds", alias = "ttl")]
    pub ttl_seconds: u64,
}

impl CachePolicy {
    fn default_enabled() -> bool {
        true
    }

    fn default_ttl_seconds() -> u64 {
        300
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            ttl_seconds: Self::default_ttl_seconds(),
        }
    }
}

/// A named parameterized SQL statement bound to one database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default)]
    pub name: String,
    pub database: String,
    pub sql: String,
    #[serde(default)]
    pub parameters: Vec<ParameterConfig>,
    #[serde(default)]
    pub cache: Option<CachePolicy>,
    /// Cache patterns cleared after this query writes successfully
    #[serde(default)]
    pub invalidates: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl QueryConfig {
    /// The active cache policy, if caching is enabled for this query
    pub fn cache_policy(&self) -> Option<&CachePolicy> {
        self.cache.as_ref().filter(|policy| policy.enabled)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterConfig> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "delete")]
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationConfig {
    #[serde(default = "PaginationConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "PaginationConfig::default_size", alias = "default_page_size")]
    pub default_size: u32,
    #[serde(default = "PaginationConfig::default_max_size", alias = "max_page_size")]
    pub max_size: u32,
}

impl PaginationConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_size() -> u32 {
        20
    }

    fn default_max_size() -> u32 {
        100
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            default_size: Self::default_size(),
            max_size: Self::default_max_size(),
        }
    }
}

/// Shape of the serialized response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseShape {
    #[serde(alias = "SINGLE", alias = "object")]
    Single,
    #[default]
    #[serde(alias = "LIST")]
    List,
    #[serde(alias = "PAGED")]
    Paged,
}

/// A named HTTP route bound to one query (and optionally a count query)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEndpointConfig {
    #[serde(default)]
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub query: String,
    #[serde(default)]
    pub count_query: Option<String>,
    #[serde(default)]
    pub pagination: Option<PaginationConfig>,
    #[serde(default)]
    pub response: ResponseShape,
    #[serde(default)]
    pub description: Option<String>,
}

impl ApiEndpointConfig {
    /// Pagination policy when pagination is enabled
    pub fn pagination_policy(&self) -> Option<&PaginationConfig> {
        self.pagination.as_ref().filter(|p| p.enabled)
    }

    pub fn is_paginated(&self) -> bool {
        self.pagination_policy().is_some()
    }

    /// Names of `{param}` segments in the path template, in order
    pub fn path_parameters(&self) -> Vec<&str> {
        path_template_parameters(&self.path)
    }
}

/// Extract `{name}` placeholders from an axum-style path template
pub fn path_template_parameters(path: &str) -> Vec<&str> {
    path.split('/')
        .filter_map(|segment| {
            segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .map(|s| s.trim_start_matches('*'))
        })
        .collect()
}
