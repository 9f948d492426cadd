// SQLite driver: one serialized connection behind an async mutex
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::{BoundValue, Column, Row, SchemaCatalog, Table};
use crate::services::database::adapter::{
    DatabaseDriver, DatabaseSession, DatabaseType, DriverError, PoolStatus, TEXT_TIMESTAMP_FORMAT,
};

pub struct SqliteDriver {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDriver {
    /// Open `sqlite::memory:`, `sqlite:path`, `sqlite://path` or a bare path
    pub fn open(url: &str) -> Result<Self, DriverError> {
        let path = url
            .strip_prefix("sqlite:")
            .map(|rest| rest.trim_start_matches("//"))
            .unwrap_or(url);

        let conn = if path.is_empty() || path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| DriverError::Connect(format!("Failed to open SQLite database: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn to_sqlite(value: &BoundValue) -> SqliteValue {
        match value {
            BoundValue::Null => SqliteValue::Null,
            BoundValue::Text(s) => SqliteValue::Text(s.clone()),
            BoundValue::Integer(v) => SqliteValue::Integer(i64::from(*v)),
            BoundValue::Long(v) => SqliteValue::Integer(*v),
            BoundValue::Double(v) => SqliteValue::Real(*v),
            BoundValue::Boolean(v) => SqliteValue::Integer(i64::from(*v)),
            BoundValue::Date(d) => SqliteValue::Text(d.format("%Y-%m-%d").to_string()),
            BoundValue::Timestamp(ts) => SqliteValue::Text(ts.format(TEXT_TIMESTAMP_FORMAT).to_string()),
        }
    }

    fn sqlite_value_to_json(value: ValueRef<'_>) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => json!(i),
            ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Text(bytes) => json!(String::from_utf8_lossy(bytes)),
            ValueRef::Blob(bytes) => json!(format!("<blob {} bytes>", bytes.len())),
        }
    }

    fn read_catalog(conn: &Connection, database: &str) -> rusqlite::Result<SchemaCatalog> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let mut info = conn.prepare(&format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\"")))?;
            let columns = info
                .query_map([], |row| {
                    Ok(Column {
                        name: row.get(1)?,
                        data_type: row.get(2)?,
                        is_nullable: row.get::<_, i64>(3)? == 0,
                    })
                })?
                .collect::<rusqlite::Result<Vec<Column>>>()?;
            tables.push(Table {
                name,
                schema: None,
                columns,
            });
        }

        Ok(SchemaCatalog::new(database, tables))
    }
}

#[async_trait::async_trait]
impl DatabaseDriver for SqliteDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn acquire(&self) -> Result<Box<dyn DatabaseSession>, DriverError> {
        let conn = self.conn.clone().lock_owned().await;
        Ok(Box::new(SqliteSession { conn }))
    }

    async fn fetch_catalog(&self, database: &str) -> Result<SchemaCatalog, DriverError> {
        let conn = self.conn.lock().await;
        Self::read_catalog(&conn, database)
            .map_err(|e| DriverError::Statement(format!("Failed to read schema: {}", e)))
    }

    fn pool_status(&self) -> PoolStatus {
        let available = usize::from(self.conn.try_lock().is_ok());
        PoolStatus {
            size: 1,
            available,
            max_size: 1,
        }
    }
}

pub struct SqliteSession {
    conn: OwnedMutexGuard<Connection>,
}

#[async_trait::async_trait]
impl DatabaseSession for SqliteSession {
    async fn query(&mut self, sql: &str, params: &[BoundValue]) -> Result<Vec<Row>, DriverError> {
        let values: Vec<SqliteValue> = params.iter().map(SqliteDriver::to_sqlite).collect();
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| DriverError::Statement(e.to_string()))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt
            .query(params_from_iter(values.iter()))
            .map_err(|e| DriverError::Statement(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| DriverError::Statement(e.to_string()))? {
            let mut record = Row::new();
            for (idx, column) in columns.iter().enumerate() {
                let value = row
                    .get_ref(idx)
                    .map_err(|e| DriverError::Conversion(e.to_string()))?;
                record.insert(column.clone(), SqliteDriver::sqlite_value_to_json(value));
            }
            out.push(record);
        }
        Ok(out)
    }

    async fn execute(&mut self, sql: &str, params: &[BoundValue]) -> Result<u64, DriverError> {
        let values: Vec<SqliteValue> = params.iter().map(SqliteDriver::to_sqlite).collect();
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| DriverError::Statement(e.to_string()))?;
        let affected = stmt
            .execute(params_from_iter(values.iter()))
            .map_err(|e| DriverError::Statement(e.to_string()))?;
        Ok(affected as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    async fn seeded() -> SqliteDriver {
        let driver = SqliteDriver::open("sqlite::memory:").unwrap();
        let mut session = driver.acquire().await.unwrap();
        session
            .execute(
                "CREATE TABLE stock_trades (id INTEGER PRIMARY KEY, symbol TEXT NOT NULL, price REAL, traded_on TEXT)",
                &[],
            )
            .await
            .unwrap();
        session
            .execute(
                "INSERT INTO stock_trades (symbol, price, traded_on) VALUES ('AAPL', 189.5, '2024-03-01'), ('MSFT', 410.25, '2024-03-02')",
                &[],
            )
            .await
            .unwrap();
        drop(session);
        driver
    }

    #[tokio::test]
    async fn test_query_with_parameters() {
        let driver = seeded().await;
        let mut session = driver.acquire().await.unwrap();
        let rows = session
            .query(
                "SELECT id, symbol, price FROM stock_trades WHERE symbol = ?",
                &[BoundValue::Text("AAPL".into())],
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        let keys: Vec<&String> = rows[0].keys().collect();
        assert_eq!(keys, vec!["id", "symbol", "price"]);
        assert_eq!(rows[0]["symbol"], json!("AAPL"));
        assert_eq!(rows[0]["price"], json!(189.5));
    }

    #[tokio::test]
    async fn test_date_binding() {
        let driver = seeded().await;
        let mut session = driver.acquire().await.unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let rows = session
            .query(
                "SELECT symbol FROM stock_trades WHERE traded_on = ?",
                &[BoundValue::Date(day)],
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["symbol"], json!("MSFT"));
    }

    #[tokio::test]
    async fn test_execute_returns_affected_rows() {
        let driver = seeded().await;
        let mut session = driver.acquire().await.unwrap();
        let affected = session
            .execute("UPDATE stock_trades SET price = ? WHERE symbol = ?", &[
                BoundValue::Double(1.0),
                BoundValue::Text("MSFT".into()),
            ])
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }

    #[tokio::test]
    async fn test_statement_error() {
        let driver = seeded().await;
        let mut session = driver.acquire().await.unwrap();
        let err = session.query("SELECT * FROM missing_table", &[]).await.unwrap_err();
        assert!(matches!(err, DriverError::Statement(_)));
    }

    #[tokio::test]
    async fn test_fetch_catalog() {
        let driver = seeded().await;
        let catalog = driver.fetch_catalog("trades").await.unwrap();
        let table = catalog.table("STOCK_TRADES").unwrap();
        assert!(table.has_column("symbol"));
        assert!(!table.has_column("volume"));
        assert!(driver.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_pool_status_reflects_checkout() {
        let driver = seeded().await;
        assert_eq!(driver.pool_status().available, 1);
        let _session = driver.acquire().await.unwrap();
        assert_eq!(driver.pool_status().available, 0);
    }
}
