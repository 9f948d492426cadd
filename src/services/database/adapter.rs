// Driver abstraction shared by every supported database
use std::fmt;
use thiserror::Error;

use crate::api::middleware::AppError;
use crate::models::{BoundValue, DatabaseConfig, Row, SchemaCatalog};

/// Supported database families. Doris and MariaDB speak the MySQL protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    PostgreSQL,
    MySQL,
    SQLite,
}

impl DatabaseType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Some(DatabaseType::PostgreSQL),
            "mysql" | "mariadb" | "doris" => Some(DatabaseType::MySQL),
            "sqlite" | "sqlite3" => Some(DatabaseType::SQLite),
            _ => None,
        }
    }

    /// Explicit driver identifier first, URL scheme second
    pub fn resolve(config: &DatabaseConfig) -> Result<Self, AppError> {
        if let Some(driver) = config.driver.as_deref() {
            return Self::parse(driver).ok_or_else(|| {
                AppError::ConfigLoad(format!(
                    "Database '{}' uses unsupported driver '{}'",
                    config.name, driver
                ))
            });
        }

        let scheme = config.url.split(':').next().unwrap_or_default();
        Self::parse(scheme).ok_or_else(|| {
            AppError::ConfigLoad(format!(
                "Cannot infer a driver for database '{}' from its URL scheme '{}'",
                config.name, scheme
            ))
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::PostgreSQL => "postgresql",
            DatabaseType::MySQL => "mysql",
            DatabaseType::SQLite => "sqlite",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Low-level driver failures, mapped onto [`AppError`] by the callers that
/// know which database and query they concern
#[derive(Debug, Error)]
pub enum DriverError {
    /// No connection could be established
    #[error("{0}")]
    Connect(String),

    /// The pool's own wait timeout elapsed
    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    /// The server rejected or failed the statement
    #[error("{0}")]
    Statement(String),

    /// A value could not be converted to or from the driver's types
    #[error("{0}")]
    Conversion(String),
}

/// Connection pool status information
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
    pub max_size: usize,
}

/// One checked-out connection. Dropping it returns the connection to its pool.
#[async_trait::async_trait]
pub trait DatabaseSession: Send {
    /// Run a row-returning statement with positional `?` parameters
    async fn query(&mut self, sql: &str, params: &[BoundValue]) -> Result<Vec<Row>, DriverError>;

    /// Run a write statement, returning the affected row count
    async fn execute(&mut self, sql: &str, params: &[BoundValue]) -> Result<u64, DriverError>;
}

/// A pooled database, able to hand out sessions and describe its schema
#[async_trait::async_trait]
pub trait DatabaseDriver: Send + Sync {
    fn database_type(&self) -> DatabaseType;

    /// Check out a connection, waiting at most the pool's own timeout
    async fn acquire(&self) -> Result<Box<dyn DatabaseSession>, DriverError>;

    /// Cheap round trip proving the database is reachable
    async fn probe(&self) -> Result<(), DriverError> {
        let mut session = self.acquire().await?;
        session.query("SELECT 1", &[]).await.map(|_| ())
    }

    /// Tables and columns from the live metadata catalog
    async fn fetch_catalog(&self, database: &str) -> Result<SchemaCatalog, DriverError>;

    fn pool_status(&self) -> PoolStatus;
}

/// Short name of a bound value's kind, for conversion errors that must not
/// echo the value itself
pub(crate) fn value_kind(value: &BoundValue) -> &'static str {
    match value {
        BoundValue::Null => "null",
        BoundValue::Text(_) => "text",
        BoundValue::Integer(_) => "integer",
        BoundValue::Long(_) => "long",
        BoundValue::Double(_) => "double",
        BoundValue::Boolean(_) => "boolean",
        BoundValue::Date(_) => "date",
        BoundValue::Timestamp(_) => "timestamp",
    }
}

/// Wire format of timestamps for drivers that bind them as text
pub(crate) const TEXT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str, driver: Option<&str>) -> DatabaseConfig {
        DatabaseConfig {
            name: "main".into(),
            url: url.into(),
            username: None,
            password: None,
            driver: driver.map(String::from),
            pool: Default::default(),
        }
    }

    #[test]
    fn test_resolve_from_scheme() {
        assert_eq!(
            DatabaseType::resolve(&config("postgres://localhost/db", None)).unwrap(),
            DatabaseType::PostgreSQL
        );
        assert_eq!(
            DatabaseType::resolve(&config("mariadb://localhost/db", None)).unwrap(),
            DatabaseType::MySQL
        );
        assert_eq!(
            DatabaseType::resolve(&config("sqlite::memory:", None)).unwrap(),
            DatabaseType::SQLite
        );
    }

    #[test]
    fn test_explicit_driver_wins() {
        let cfg = config("mysql://fe-host:9030/analytics", Some("doris"));
        assert_eq!(DatabaseType::resolve(&cfg).unwrap(), DatabaseType::MySQL);

        let cfg = config("jdbc:oracle:thin:@host", None);
        assert!(matches!(DatabaseType::resolve(&cfg), Err(AppError::ConfigLoad(_))));

        let cfg = config("postgres://localhost/db", Some("druid"));
        assert!(DatabaseType::resolve(&cfg).is_err());
    }
}
