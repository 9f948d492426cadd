// Database abstraction layer for multi-database support
pub mod adapter;
pub mod mysql;
pub mod postgresql;
pub mod sqlite;

pub use adapter::{DatabaseDriver, DatabaseSession, DatabaseType, DriverError, PoolStatus};
pub use mysql::MySqlDriver;
pub use postgresql::PostgresDriver;
pub use sqlite::SqliteDriver;

use std::sync::Arc;

use crate::models::DatabaseConfig;

/// Connection URL with the record's separate credentials merged in, unless the
/// URL already carries its own
pub fn effective_url(config: &DatabaseConfig) -> String {
    if config.username.is_none() && config.password.is_none() {
        return config.url.clone();
    }

    match url::Url::parse(&config.url) {
        Ok(mut parsed) if parsed.has_host() && parsed.username().is_empty() => {
            if let Some(user) = config.username.as_deref() {
                let _ = parsed.set_username(user);
            }
            if let Some(password) = config.password.as_deref() {
                let _ = parsed.set_password(Some(password));
            }
            parsed.to_string()
        }
        _ => config.url.clone(),
    }
}

/// Factory function to create the appropriate driver.
/// Pools are created without connecting; the first checkout connects.
pub fn create_driver(db_type: DatabaseType, config: &DatabaseConfig) -> Result<Arc<dyn DatabaseDriver>, DriverError> {
    let url = effective_url(config);
    match db_type {
        DatabaseType::PostgreSQL => Ok(Arc::new(PostgresDriver::new(&url, &config.pool)?)),
        DatabaseType::MySQL => Ok(Arc::new(MySqlDriver::new(&url, &config.pool)?)),
        DatabaseType::SQLite => Ok(Arc::new(SqliteDriver::open(&url)?)),
    }
}
