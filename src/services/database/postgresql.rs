// PostgreSQL driver using connection pooling for optimal resource management
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{
    Config as PgConfig, ManagerConfig, Object, Pool, PoolConfig, PoolError, RecyclingMethod, TimeoutType,
};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;
use url::Url;

use crate::models::{BoundValue, Column, PoolSettings, Row, SchemaCatalog, Table};
use crate::services::database::adapter::{
    value_kind, DatabaseDriver, DatabaseSession, DatabaseType, DriverError, PoolStatus,
};
use crate::validation::SqlValidator;

type BoxedParam = Box<dyn ToSql + Sync + Send>;

pub struct PostgresDriver {
    pool: Pool,
}

impl PostgresDriver {
    pub fn new(connection_url: &str, settings: &PoolSettings) -> Result<Self, DriverError> {
        // Validate PostgreSQL URL format
        let url = Url::parse(connection_url)
            .map_err(|e| DriverError::Connect(format!("Invalid PostgreSQL URL: {}", e)))?;

        if url.scheme() != "postgresql" && url.scheme() != "postgres" {
            return Err(DriverError::Connect(
                "URL must use postgresql:// or postgres:// scheme".to_string(),
            ));
        }

        let mut pool_cfg = PoolConfig::new(settings.max_connections.max(1));
        pool_cfg.timeouts.wait = Some(settings.acquire_timeout());
        pool_cfg.timeouts.create = Some(settings.acquire_timeout());

        let mut cfg = PgConfig::new();
        cfg.url = Some(connection_url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
            .map_err(|e| DriverError::Connect(format!("Failed to create connection pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// Only waiting for a free slot is a pool timeout; a stalled connect or
    /// recycle means the server is not answering.
    fn pool_error(e: PoolError) -> DriverError {
        match e {
            PoolError::Timeout(TimeoutType::Wait) => DriverError::PoolTimeout,
            PoolError::Timeout(TimeoutType::Create) => {
                DriverError::Connect("Timed out establishing a PostgreSQL connection".to_string())
            }
            PoolError::Timeout(TimeoutType::Recycle) => {
                DriverError::Connect("Timed out checking a pooled PostgreSQL connection".to_string())
            }
            other => DriverError::Connect(format!("Failed to get connection from pool: {}", other)),
        }
    }

    async fn read_catalog(client: &tokio_postgres::Client, database: &str) -> Result<SchemaCatalog, DriverError> {
        let rows = client
            .query(
                r#"
                SELECT
                    c.table_schema::text,
                    c.table_name::text,
                    c.column_name::text,
                    c.data_type::text,
                    c.is_nullable::text
                FROM information_schema.columns c
                WHERE c.table_schema NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
                ORDER BY c.table_schema, c.table_name, c.ordinal_position
                "#,
                &[],
            )
            .await
            .map_err(|e| DriverError::Statement(format!("Failed to read schema: {}", e)))?;

        let mut grouped: BTreeMap<(String, String), Vec<Column>> = BTreeMap::new();
        for row in rows {
            let schema: String = row.get(0);
            let table: String = row.get(1);
            grouped.entry((schema, table)).or_default().push(Column {
                name: row.get(2),
                data_type: row.get(3),
                is_nullable: row.get::<_, String>(4) == "YES",
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
}

#[async_trait::async_trait]
impl DatabaseDriver for PostgresDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    async fn acquire(&self) -> Result<Box<dyn DatabaseSession>, DriverError> {
        let client = self.pool.get().await.map_err(Self::pool_error)?;
        Ok(Box::new(PostgresSession { client }))
    }

    async fn probe(&self) -> Result<(), DriverError> {
        let client = self.pool.get().await.map_err(Self::pool_error)?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| DriverError::Connect(format!("Connection test failed: {}", e)))?;
        Ok(())
    }

    async fn fetch_catalog(&self, database: &str) -> Result<SchemaCatalog, DriverError> {
        let client = self.pool.get().await.map_err(Self::pool_error)?;
        Self::read_catalog(&client, database).await
    }

    fn pool_status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            size: status.size,
            available: status.available,
            max_size: status.max_size,
        }
    }
}

pub struct PostgresSession {
    client: Object,
}

impl PostgresSession {
    fn statement_error(e: tokio_postgres::Error) -> DriverError {
        match e.as_db_error() {
            Some(db_error) => DriverError::Statement(format!(
                "Code: {}, Message: {}",
                db_error.code().code(),
                db_error.message()
            )),
            None => DriverError::Statement(e.to_string()),
        }
    }

    /// Prepare the statement and convert each value to the parameter type the
    /// server inferred for its position
    async fn prepare(
        &self,
        sql: &str,
        params: &[BoundValue],
    ) -> Result<(tokio_postgres::Statement, Vec<BoxedParam>), DriverError> {
        let sql = SqlValidator::numbered_placeholders(sql);
        let stmt = self
            .client
            .prepare_cached(&sql)
            .await
            .map_err(Self::statement_error)?;

        if stmt.params().len() != params.len() {
            return Err(DriverError::Statement(format!(
                "Statement expects {} parameters, {} supplied",
                stmt.params().len(),
                params.len()
            )));
        }

        let values = stmt
            .params()
            .iter()
            .zip(params)
            .map(|(ty, value)| to_postgres(ty, value))
            .collect::<Result<Vec<_>, _>>()?;

        Ok((stmt, values))
    }
}

#[async_trait::async_trait]
impl DatabaseSession for PostgresSession {
    async fn query(&mut self, sql: &str, params: &[BoundValue]) -> Result<Vec<Row>, DriverError> {
        let (stmt, values) = self.prepare(sql, params).await?;
        let refs: Vec<&(dyn ToSql + Sync)> = values.iter().map(|v| &**v as &(dyn ToSql + Sync)).collect();
        let rows = self
            .client
            .query(&stmt, &refs)
            .await
            .map_err(Self::statement_error)?;

        rows.iter().map(row_to_json).collect()
    }

    async fn execute(&mut self, sql: &str, params: &[BoundValue]) -> Result<u64, DriverError> {
        let (stmt, values) = self.prepare(sql, params).await?;
        let refs: Vec<&(dyn ToSql + Sync)> = values.iter().map(|v| &**v as &(dyn ToSql + Sync)).collect();
        self.client
            .execute(&stmt, &refs)
            .await
            .map_err(Self::statement_error)
    }
}

fn typed<T, F>(ty: &Type, value: &BoundValue, convert: F) -> Result<BoxedParam, DriverError>
where
    T: ToSql + Sync + Send + 'static,
    F: FnOnce(&BoundValue) -> Option<T>,
{
    if value.is_null() {
        return Ok(Box::new(None::<T>));
    }
    convert(value)
        .map(|v| Box::new(Some(v)) as BoxedParam)
        .ok_or_else(|| {
            DriverError::Conversion(format!(
                "Cannot bind a {} value to a parameter of type {}",
                value_kind(value),
                ty.name()
            ))
        })
}

fn to_postgres(ty: &Type, value: &BoundValue) -> Result<BoxedParam, DriverError> {
    match *ty {
        Type::INT2 => typed(ty, value, |v| v.as_i64().and_then(|i| i16::try_from(i).ok())),
        Type::INT4 => typed(ty, value, |v| v.as_i64().and_then(|i| i32::try_from(i).ok())),
        Type::INT8 => typed(ty, value, BoundValue::as_i64),
        Type::FLOAT4 => typed(ty, value, |v| v.as_f64().map(|f| f as f32)),
        Type::FLOAT8 => typed(ty, value, BoundValue::as_f64),
        Type::BOOL => typed(ty, value, BoundValue::as_bool),
        Type::DATE => typed::<NaiveDate, _>(ty, value, BoundValue::as_date),
        Type::TIMESTAMP => typed::<NaiveDateTime, _>(ty, value, BoundValue::as_timestamp),
        Type::TIMESTAMPTZ => typed::<DateTime<Utc>, _>(ty, value, |v| v.as_timestamp().map(|ts| ts.and_utc())),
        Type::JSON | Type::JSONB => typed(ty, value, |v| match v {
            BoundValue::Text(s) => serde_json::from_str(s).ok().or_else(|| Some(json!(s))),
            other => other.to_text().map(|t| serde_json::from_str(&t).unwrap_or(Value::String(t))),
        }),
        Type::UUID => typed(ty, value, |v| v.to_text().and_then(|t| uuid::Uuid::parse_str(&t).ok())),
        Type::NUMERIC => typed(ty, value, to_decimal),
        _ => typed(ty, value, BoundValue::to_text),
    }
}

fn to_decimal(value: &BoundValue) -> Option<Decimal> {
    match value {
        BoundValue::Integer(v) => Some(Decimal::from(*v)),
        BoundValue::Long(v) => Some(Decimal::from(*v)),
        BoundValue::Double(v) => Decimal::from_f64(*v),
        BoundValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A JSON number when `f64` carries the value exactly, otherwise the exact
/// decimal text
fn decimal_to_json(value: Decimal) -> Value {
    let normalized = value.normalize();
    if normalized.scale() == 0 {
        if let Some(i) = normalized.to_i64() {
            return json!(i);
        }
    }
    match normalized.to_f64().and_then(serde_json::Number::from_f64) {
        Some(n) if n.to_string() == normalized.to_string() => Value::Number(n),
        _ => Value::String(normalized.to_string()),
    }
}

fn row_to_json(row: &tokio_postgres::Row) -> Result<Row, DriverError> {
    let conversion = |e: tokio_postgres::Error| DriverError::Conversion(e.to_string());
    let mut record = Row::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let value: Value = match *column.type_() {
            Type::INT2 => row.try_get::<_, Option<i16>>(idx).map_err(conversion)?.map(|v| json!(v)).unwrap_or(Value::Null),
            Type::INT4 => row.try_get::<_, Option<i32>>(idx).map_err(conversion)?.map(|v| json!(v)).unwrap_or(Value::Null),
            Type::INT8 => row.try_get::<_, Option<i64>>(idx).map_err(conversion)?.map(|v| json!(v)).unwrap_or(Value::Null),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)
                .map_err(conversion)?
                .and_then(|v| serde_json::Number::from_f64(f64::from(v)))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(idx)
                .map_err(conversion)?
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Type::BOOL => row.try_get::<_, Option<bool>>(idx).map_err(conversion)?.map(|v| json!(v)).unwrap_or(Value::Null),
            Type::DATE => row
                .try_get::<_, Option<NaiveDate>>(idx)
                .map_err(conversion)?
                .map(|d| json!(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
            Type::TIMESTAMP => row
                .try_get::<_, Option<NaiveDateTime>>(idx)
                .map_err(conversion)?
                .map(|ts| json!(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<DateTime<Utc>>>(idx)
                .map_err(conversion)?
                .map(|ts| json!(ts.to_rfc3339()))
                .unwrap_or(Value::Null),
            Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx).map_err(conversion)?.unwrap_or(Value::Null),
            Type::UUID => row
                .try_get::<_, Option<uuid::Uuid>>(idx)
                .map_err(conversion)?
                .map(|u| json!(u.to_string()))
                .unwrap_or(Value::Null),
            Type::NUMERIC => row
                .try_get::<_, Option<Decimal>>(idx)
                .map_err(conversion)?
                .map(decimal_to_json)
                .unwrap_or(Value::Null),
            _ => match row.try_get::<_, Option<String>>(idx) {
                Ok(Some(v)) => json!(v),
                Ok(None) => Value::Null,
                // Types without a text mapping (arrays, ranges, ...) show their type name
                Err(_) => json!(format!("<{}>", column.type_().name())),
            },
        };
        record.insert(column.name().to_string(), value);
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_rejects_foreign_scheme() {
        let err = PostgresDriver::new("mysql://localhost/db", &PoolSettings::default()).err();
        assert!(matches!(err, Some(DriverError::Connect(_))));
    }

    #[tokio::test]
    async fn test_pool_created_lazily() {
        // No connection is attempted until the first checkout
        let driver = PostgresDriver::new("postgres://user:pw@127.0.0.1:1/none", &PoolSettings::default()).unwrap();
        assert_eq!(driver.pool_status().size, 0);
        assert_eq!(driver.database_type(), DatabaseType::PostgreSQL);
    }

    #[test]
    fn test_pool_timeout_classification() {
        assert!(matches!(
            PostgresDriver::pool_error(PoolError::Timeout(TimeoutType::Wait)),
            DriverError::PoolTimeout
        ));
        assert!(matches!(
            PostgresDriver::pool_error(PoolError::Timeout(TimeoutType::Create)),
            DriverError::Connect(_)
        ));
        assert!(matches!(
            PostgresDriver::pool_error(PoolError::Timeout(TimeoutType::Recycle)),
            DriverError::Connect(_)
        ));
        assert!(matches!(PostgresDriver::pool_error(PoolError::Closed), DriverError::Connect(_)));
    }

    #[test]
    fn test_parameter_conversion_follows_server_type() {
        assert!(to_postgres(&Type::INT4, &BoundValue::Long(42)).is_ok());
        assert!(to_postgres(&Type::INT2, &BoundValue::Long(100_000)).is_err());
        assert!(to_postgres(&Type::INT8, &BoundValue::Null).is_ok());
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert!(to_postgres(&Type::DATE, &BoundValue::Date(day)).is_ok());
        assert!(to_postgres(&Type::TIMESTAMPTZ, &BoundValue::Date(day)).is_ok());
        assert!(to_postgres(&Type::BOOL, &BoundValue::Text("maybe".into())).is_err());
        assert!(to_postgres(&Type::TEXT, &BoundValue::Integer(7)).is_ok());
    }

    #[test]
    fn test_numeric_parameters_bind_as_decimal() {
        assert!(to_postgres(&Type::NUMERIC, &BoundValue::Text("1234.5678".into())).is_ok());
        assert!(to_postgres(&Type::NUMERIC, &BoundValue::Long(42)).is_ok());
        assert!(to_postgres(&Type::NUMERIC, &BoundValue::Double(10.25)).is_ok());
        assert!(to_postgres(&Type::NUMERIC, &BoundValue::Null).is_ok());
        assert!(to_postgres(&Type::NUMERIC, &BoundValue::Text("ten".into())).is_err());
        assert_eq!(to_decimal(&BoundValue::Text(" 19.99 ".into())), Some(Decimal::new(1999, 2)));
    }

    #[test]
    fn test_numeric_columns_keep_their_value() {
        assert_eq!(decimal_to_json(Decimal::new(1999, 2)), json!(19.99));
        assert_eq!(decimal_to_json(Decimal::new(1500, 2)), json!(15));
        assert_eq!(decimal_to_json(Decimal::new(-42, 0)), json!(-42));
        // More digits than an f64 holds: exact text instead of a rounded number
        assert_eq!(
            decimal_to_json("12345678901234567.891".parse().unwrap()),
            json!("12345678901234567.891")
        );
    }

    #[test]
    fn test_conversion_error_hides_value() {
        let err = to_postgres(&Type::UUID, &BoundValue::Text("secret-token".into())).err().unwrap();
        assert!(!err.to_string().contains("secret-token"));
    }
}
