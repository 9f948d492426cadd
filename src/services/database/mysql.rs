// MySQL-protocol driver (MySQL, MariaDB, Doris) using connection pooling
use chrono::{Datelike, Timelike};
use mysql_async::{prelude::*, Conn, Opts, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, Row as MySqlRow, Value as MySqlValue};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::models::{BoundValue, Column, PoolSettings, Row, SchemaCatalog, Table};
use crate::services::database::adapter::{
    DatabaseDriver, DatabaseSession, DatabaseType, DriverError, PoolStatus,
};

pub struct MySqlDriver {
    pool: Pool,
    // mysql_async keeps its live counters private, so checkouts are counted here
    slots: Arc<Semaphore>,
    max_size: usize,
    acquire_timeout: Duration,
}

impl MySqlDriver {
    pub fn new(connection_url: &str, settings: &PoolSettings) -> Result<Self, DriverError> {
        // mysql_async only understands the mysql:// scheme
        let normalized = match connection_url.split_once("://") {
            Some(("mariadb" | "doris", rest)) => format!("mysql://{}", rest),
            _ => connection_url.to_string(),
        };

        let opts = Opts::from_url(&normalized)
            .map_err(|e| DriverError::Connect(format!("Invalid MySQL URL: {}", e)))?;

        let max = settings.max_connections.max(1);
        let min = settings.min_connections.min(max);
        let constraints = PoolConstraints::new(min, max).ok_or_else(|| {
            DriverError::Connect(format!("Invalid pool bounds: min {} max {}", min, max))
        })?;

        let opts = OptsBuilder::from_opts(opts).pool_opts(PoolOpts::default().with_constraints(constraints));

        Ok(Self {
            pool: Pool::new(opts),
            slots: Arc::new(Semaphore::new(max)),
            max_size: max,
            acquire_timeout: settings.acquire_timeout(),
        })
    }

    /// Get a connection from the pool, holding one slot while it is in use
    async fn get_conn(&self) -> Result<(Conn, OwnedSemaphorePermit), DriverError> {
        bounded_checkout(&self.slots, self.acquire_timeout, self.pool.get_conn()).await
    }

    /// Helper function to convert MySQL Value to JSON Value
    fn mysql_value_to_json(mysql_val: MySqlValue) -> Value {
        match mysql_val {
            MySqlValue::NULL => Value::Null,
            MySqlValue::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(s) => json!(s),
                Err(e) => json!(format!("<binary {} bytes>", e.as_bytes().len())),
            },
            MySqlValue::Int(i) => json!(i),
            MySqlValue::UInt(u) => json!(u),
            MySqlValue::Float(f) => json!(f),
            MySqlValue::Double(d) => json!(d),
            MySqlValue::Date(y, m, d, 0, 0, 0, 0) => json!(format!("{:04}-{:02}-{:02}", y, m, d)),
            MySqlValue::Date(y, m, d, h, min, s, micros) => {
                if micros == 0 {
                    json!(format!("{:04}-{:02}-{:02}T{:02}:{:02}:{:02}", y, m, d, h, min, s))
                } else {
                    json!(format!("{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}", y, m, d, h, min, s, micros))
                }
            }
            MySqlValue::Time(is_neg, d, h, m, s, _) => {
                let sign = if is_neg { "-" } else { "" };
                let total_hours = d * 24 + h as u32;
                json!(format!("{}{}:{:02}:{:02}", sign, total_hours, m, s))
            }
        }
    }

    fn to_mysql(value: &BoundValue) -> MySqlValue {
        match value {
            BoundValue::Null => MySqlValue::NULL,
            BoundValue::Text(s) => MySqlValue::Bytes(s.clone().into_bytes()),
            BoundValue::Integer(v) => MySqlValue::Int(i64::from(*v)),
            BoundValue::Long(v) => MySqlValue::Int(*v),
            BoundValue::Double(v) => MySqlValue::Double(*v),
            BoundValue::Boolean(v) => MySqlValue::Int(i64::from(*v)),
            BoundValue::Date(d) => MySqlValue::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0),
            BoundValue::Timestamp(ts) => MySqlValue::Date(
                ts.year() as u16,
                ts.month() as u8,
                ts.day() as u8,
                ts.hour() as u8,
                ts.minute() as u8,
                ts.second() as u8,
                ts.nanosecond() / 1_000,
            ),
        }
    }

    fn params(params: &[BoundValue]) -> Params {
        if params.is_empty() {
            Params::Empty
        } else {
            Params::Positional(params.iter().map(Self::to_mysql).collect())
        }
    }
}

#[async_trait::async_trait]
impl DatabaseDriver for MySqlDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    async fn acquire(&self) -> Result<Box<dyn DatabaseSession>, DriverError> {
        let (conn, slot) = self.get_conn().await?;
        Ok(Box::new(MySqlSession { conn, _slot: slot }))
    }

    async fn probe(&self) -> Result<(), DriverError> {
        let (mut conn, _slot) = self.get_conn().await?;
        conn.ping()
            .await
            .map_err(|e| DriverError::Connect(format!("Connection test failed: {}", e)))
    }

    async fn fetch_catalog(&self, database: &str) -> Result<SchemaCatalog, DriverError> {
        let (mut conn, _slot) = self.get_conn().await?;
        let rows: Vec<(String, String, String, String, String)> = conn
            .query(
                r#"
                SELECT
                    c.TABLE_SCHEMA,
                    c.TABLE_NAME,
                    c.COLUMN_NAME,
                    c.DATA_TYPE,
                    c.IS_NULLABLE
                FROM information_schema.COLUMNS c
                WHERE c.TABLE_SCHEMA = DATABASE()
                ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
                "#,
            )
            .await
            .map_err(|e| DriverError::Statement(format!("Failed to read schema: {}", e)))?;

        let mut grouped: BTreeMap<(String, String), Vec<Column>> = BTreeMap::new();
        for (schema, table, name, data_type, is_nullable) in rows {
            grouped.entry((schema, table)).or_default().push(Column {
                name,
                data_type,
                is_nullable: is_nullable == "YES",
            });
        }

        let tables = grouped
            .into_iter()
            .map(|((schema, name), columns)| Table {
                name,
                schema: Some(schema),
                columns,
            })
            .collect();

        Ok(SchemaCatalog::new(database, tables))
    }

    fn pool_status(&self) -> PoolStatus {
        let available = self.slots.available_permits();
        PoolStatus {
            size: self.max_size - available,
            available,
            max_size: self.max_size,
        }
    }
}

/// Wait at most `timeout` for a free slot, then at most `timeout` for the
/// connection. Running out of slots is a pool timeout; a connect that stalls
/// is a connection failure.
async fn bounded_checkout<T, E, F>(
    slots: &Arc<Semaphore>,
    timeout: Duration,
    connect: F,
) -> Result<(T, OwnedSemaphorePermit), DriverError>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let slot = tokio::time::timeout(timeout, slots.clone().acquire_owned())
        .await
        .map_err(|_| DriverError::PoolTimeout)?
        .map_err(|_| DriverError::Connect("MySQL connection pool is closed".to_string()))?;

    let conn = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| {
            DriverError::Connect(format!(
                "Timed out establishing a MySQL connection after {} ms",
                timeout.as_millis()
            ))
        })?
        .map_err(|e| DriverError::Connect(format!("Failed to get MySQL connection from pool: {}", e)))?;

    Ok((conn, slot))
}

pub struct MySqlSession {
    conn: Conn,
    _slot: OwnedSemaphorePermit,
}

#[async_trait::async_trait]
impl DatabaseSession for MySqlSession {
    async fn query(&mut self, sql: &str, params: &[BoundValue]) -> Result<Vec<Row>, DriverError> {
        let rows: Vec<MySqlRow> = self
            .conn
            .exec(sql, MySqlDriver::params(params))
            .await
            .map_err(|e| DriverError::Statement(format!("Query execution failed: {}", e)))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut record = Row::new();
            let columns = row.columns_ref();

            for (idx, column) in columns.iter().enumerate() {
                let value: Value = match row.get_opt::<MySqlValue, usize>(idx) {
                    Some(Ok(mysql_val)) => MySqlDriver::mysql_value_to_json(mysql_val),
                    Some(Err(_)) | None => Value::Null,
                };
                record.insert(column.name_str().to_string(), value);
            }
            out.push(record);
        }
        Ok(out)
    }

    async fn execute(&mut self, sql: &str, params: &[BoundValue]) -> Result<u64, DriverError> {
        self.conn
            .exec_drop(sql, MySqlDriver::params(params))
            .await
            .map_err(|e| DriverError::Statement(format!("Statement execution failed: {}", e)))?;
        Ok(self.conn.affected_rows())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    #[test]
    fn test_value_to_json() {
        assert_eq!(MySqlDriver::mysql_value_to_json(MySqlValue::Int(7)), json!(7));
        assert_eq!(
            MySqlDriver::mysql_value_to_json(MySqlValue::Bytes(b"AAPL".to_vec())),
            json!("AAPL")
        );
        assert_eq!(
            MySqlDriver::mysql_value_to_json(MySqlValue::Date(2024, 3, 1, 0, 0, 0, 0)),
            json!("2024-03-01")
        );
        assert_eq!(
            MySqlDriver::mysql_value_to_json(MySqlValue::Date(2024, 3, 1, 9, 30, 5, 0)),
            json!("2024-03-01T09:30:05")
        );
    }

    #[test]
    fn test_bound_value_conversion() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            MySqlDriver::to_mysql(&BoundValue::Date(day)),
            MySqlValue::Date(2024, 3, 1, 0, 0, 0, 0)
        );
        let ts = NaiveDateTime::parse_from_str("2024-03-01 09:30:05.250", "%Y-%m-%d %H:%M:%S%.f").unwrap();
        assert_eq!(
            MySqlDriver::to_mysql(&BoundValue::Timestamp(ts)),
            MySqlValue::Date(2024, 3, 1, 9, 30, 5, 250_000)
        );
        assert_eq!(MySqlDriver::to_mysql(&BoundValue::Boolean(true)), MySqlValue::Int(1));
        assert!(matches!(MySqlDriver::params(&[]), Params::Empty));
    }

    #[tokio::test]
    async fn test_exhausted_slots_are_a_pool_timeout() {
        let slots = Arc::new(Semaphore::new(1));
        let _held = slots.clone().acquire_owned().await.unwrap();

        let err = bounded_checkout(&slots, Duration::from_millis(50), async { Ok::<_, String>(()) })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DriverError::PoolTimeout));
    }

    #[tokio::test]
    async fn test_stalled_connect_is_a_connection_failure() {
        let slots = Arc::new(Semaphore::new(1));
        let stalled = std::future::pending::<Result<(), String>>();

        let err = bounded_checkout(&slots, Duration::from_millis(50), stalled).await.err().unwrap();
        assert!(matches!(err, DriverError::Connect(ref m) if m.contains("Timed out")));
        assert_eq!(slots.available_permits(), 1);

        let (_, slot) = bounded_checkout(&slots, Duration::from_millis(50), async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(slots.available_permits(), 0);
        drop(slot);
        assert_eq!(slots.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_scheme_aliases_accepted() {
        let settings = PoolSettings::default();
        assert!(MySqlDriver::new("doris://root@127.0.0.1:9030/analytics", &settings).is_ok());
        assert!(MySqlDriver::new("mariadb://root@127.0.0.1:3306/shop", &settings).is_ok());
        assert!(MySqlDriver::new("not a url", &settings).is_err());
    }
}
