use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{ApiEndpointConfig, ConfigDocument, DatabaseConfig, QueryConfig};

/// Definition kinds kept by the store, one table each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    Database,
    Query,
    Endpoint,
}

impl DefinitionKind {
    fn table(&self) -> &'static str {
        match self {
            DefinitionKind::Database => "api_databases",
            DefinitionKind::Query => "api_queries",
            DefinitionKind::Endpoint => "api_endpoints",
        }
    }
}

/// SQLite-backed store of API definitions.
/// Uses tokio::Mutex for async-friendly locking
pub struct ConfigStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigStore {
    /// Open (or create) a store at the given path
    pub async fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path: &str = if path_str.starts_with("sqlite:") {
            let mut cleaned = path_str.trim_start_matches("sqlite:");
            cleaned = cleaned.trim_start_matches("//");
            cleaned
        } else {
            path_str.as_ref()
        };

        let conn = if clean_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(clean_path)?
        };
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().await;

        for kind in [DefinitionKind::Database, DefinitionKind::Query, DefinitionKind::Endpoint] {
            conn.execute(
                &format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {} (
                        id TEXT PRIMARY KEY,
                        name TEXT UNIQUE NOT NULL,
                        definition_json TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    )
                    "#,
                    kind.table()
                ),
                [],
            )?;
        }

        Ok(())
    }

    async fn upsert<T: Serialize>(&self, kind: DefinitionKind, name: &str, definition: &T) -> SqliteResult<()> {
        let json = serde_json::to_string(definition)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                r#"
                INSERT INTO {} (id, name, definition_json, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(name) DO UPDATE SET
                    definition_json = excluded.definition_json,
                    updated_at = excluded.updated_at
                "#,
                kind.table()
            ),
            rusqlite::params![
                uuid::Uuid::new_v4().to_string(),
                name,
                json,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn list<T: DeserializeOwned>(&self, kind: DefinitionKind) -> SqliteResult<Vec<(String, T)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT name, definition_json FROM {} ORDER BY name",
            kind.table()
        ))?;

        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            let (name, json) = row?;
            let definition: T = serde_json::from_str(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
            })?;
            out.push((name, definition));
        }
        Ok(out)
    }

    pub async fn save_database(&self, db: &DatabaseConfig) -> SqliteResult<()> {
        self.upsert(DefinitionKind::Database, &db.name, db).await
    }

    pub async fn save_query(&self, query: &QueryConfig) -> SqliteResult<()> {
        self.upsert(DefinitionKind::Query, &query.name, query).await
    }

    pub async fn save_endpoint(&self, endpoint: &ApiEndpointConfig) -> SqliteResult<()> {
        self.upsert(DefinitionKind::Endpoint, &endpoint.name, endpoint).await
    }

    /// Delete a definition by name; returns whether it existed
    pub async fn delete(&self, kind: DefinitionKind, name: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            &format!("DELETE FROM {} WHERE name = ?1", kind.table()),
            rusqlite::params![name],
        )?;
        Ok(affected > 0)
    }

    /// When the definition was last written
    pub async fn updated_at(&self, kind: DefinitionKind, name: &str) -> SqliteResult<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT updated_at FROM {} WHERE name = ?1", kind.table()),
            rusqlite::params![name],
            |row| row.get(0),
        )
        .optional()
    }

    /// Read every stored definition as one document
    pub async fn load_document(&self) -> SqliteResult<ConfigDocument> {
        let databases = self.list::<DatabaseConfig>(DefinitionKind::Database).await?;
        let queries = self.list::<QueryConfig>(DefinitionKind::Query).await?;
        let endpoints = self.list::<ApiEndpointConfig>(DefinitionKind::Endpoint).await?;

        Ok(ConfigDocument {
            databases: databases.into_iter().collect(),
            queries: queries.into_iter().collect(),
            endpoints: endpoints.into_iter().collect(),
        }
        .with_names())
    }
}
