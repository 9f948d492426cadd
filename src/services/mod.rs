pub mod config_loader;
pub mod connection_pool;
pub mod database; // Driver abstraction over PostgreSQL, MySQL and SQLite
pub mod query_cache; // Query result cache with LRU and TTL
pub mod query_service;
pub mod route_registrar;

pub use config_loader::{ConfigHandle, ConfigSource, ConfigurationLoader, SqliteStoreSource, YamlFileSource, YamlTextSource};
pub use connection_pool::*;
pub use query_cache::*;
pub use query_service::*;
pub use route_registrar::{registerable_endpoints, RouteEntry};
