use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::middleware::AppError;
use crate::models::{
    bind_parameters, ApiEndpointConfig, BoundValue, ConfigurationModel, PageRequest, PaginationInfo, ParameterBag,
    QueryConfig, QueryResult, ResolvedPage, ResponseShape, Row, RowSet,
};
use crate::services::config_loader::ConfigHandle;
use crate::services::database::{DatabaseSession, DriverError};
use crate::services::query_cache::{CacheKey, QueryResultCache};
use crate::services::ConnectionManager;
use crate::validation::{SqlValidator, StatementKind};

const REDACTED: &str = "<redacted>";

/// Runs configured endpoints: binds parameters, consults the cache, executes
/// against the endpoint's database and shapes the result
pub struct QueryExecutor {
    config: Arc<ConfigHandle>,
    connections: Arc<ConnectionManager>,
    cache: Arc<QueryResultCache>,
}

impl QueryExecutor {
    pub fn new(config: Arc<ConfigHandle>, connections: Arc<ConnectionManager>, cache: Arc<QueryResultCache>) -> Self {
        Self {
            config,
            connections,
            cache,
        }
    }

    /// Execute the named endpoint with an already-extracted parameter bag.
    ///
    /// The page request is ignored unless the endpoint is paginated.
    pub async fn execute(
        &self,
        endpoint_name: &str,
        params: &ParameterBag,
        page: Option<PageRequest>,
    ) -> Result<QueryResult, AppError> {
        let snapshot = self.config.snapshot();
        let endpoint = snapshot
            .endpoint(endpoint_name)
            .ok_or_else(|| AppError::NotFound(format!("Endpoint '{}' is not configured", endpoint_name)))?;
        let query = Self::resolve_query(&snapshot, &endpoint.query, endpoint_name)?;

        let bound = bind_parameters(query, params)?;

        if SqlValidator::statement_kind(&query.sql) == StatementKind::Write {
            return self.execute_write(&snapshot, query, &bound).await;
        }

        let resolved = match endpoint.pagination_policy() {
            Some(policy) => Some(page.unwrap_or_default().resolve(policy)?),
            None => None,
        };

        let key = CacheKey::new(&query.name, &bound, resolved.as_ref());
        let policy = query.cache_policy();
        if policy.is_some() {
            if let Some(hit) = self.cache.get(&key) {
                return Self::shape(endpoint, Self::mark_cached(hit));
            }
        }

        // Read before executing so an invalidation during the round trip wins
        let generation = self.cache.generation();
        let result = match resolved {
            Some(page) => self.execute_paged(&snapshot, endpoint, query, &bound, page, params).await?,
            None => {
                let rows = self.run_read(&snapshot, query, &query.sql, &bound, None).await?;
                QueryResult::Simple {
                    data: rows.rows,
                    cached: false,
                }
            }
        };

        if let Some(policy) = policy {
            self.cache.put(&key, result.clone(), policy.ttl(), generation);
        }

        Self::shape(endpoint, result)
    }

    fn resolve_query<'a>(
        snapshot: &'a ConfigurationModel,
        query_name: &str,
        endpoint_name: &str,
    ) -> Result<&'a QueryConfig, AppError> {
        snapshot.query(query_name).ok_or_else(|| {
            AppError::Internal(format!(
                "Endpoint '{}' references unknown query '{}'",
                endpoint_name, query_name
            ))
        })
    }

    async fn execute_paged(
        &self,
        snapshot: &ConfigurationModel,
        endpoint: &ApiEndpointConfig,
        query: &QueryConfig,
        bound: &[(String, BoundValue)],
        page: ResolvedPage,
        params: &ParameterBag,
    ) -> Result<QueryResult, AppError> {
        let count_name = endpoint.count_query.as_deref().ok_or_else(|| {
            AppError::Internal(format!("Paginated endpoint '{}' has no count query", endpoint.name))
        })?;
        let count_query = Self::resolve_query(snapshot, count_name, &endpoint.name)?;
        let count_bound = bind_parameters(count_query, params)?;

        let offset = page.offset().ok_or_else(|| {
            AppError::Validation(format!("Page {} of size {} is out of range", page.page, page.size))
        })?;

        let mut paged_params: Vec<(String, BoundValue)> = bound.to_vec();
        paged_params.push(("$size".to_string(), BoundValue::Long(page.size as i64)));
        paged_params.push(("$offset".to_string(), BoundValue::Long(offset)));

        let paged_sql = SqlValidator::paginate(&query.sql);
        let mut session = self.connections.acquire(&query.database).await?;
        let rows = self
            .run_read(snapshot, query, &paged_sql, &paged_params, Some(&mut session))
            .await?;

        // A count query on another database needs its own connection
        let count_rows = if count_query.database == query.database {
            self.run_read(snapshot, count_query, &count_query.sql, &count_bound, Some(&mut session))
                .await?
        } else {
            drop(session);
            self.run_read(snapshot, count_query, &count_query.sql, &count_bound, None).await?
        };
        let total = Self::extract_count(count_query, &count_rows.rows)?;

        Ok(QueryResult::Paged {
            data: rows.rows,
            pagination: PaginationInfo::new(page.page, page.size, total),
            cached: false,
        })
    }

    async fn execute_write(
        &self,
        snapshot: &ConfigurationModel,
        query: &QueryConfig,
        bound: &[(String, BoundValue)],
    ) -> Result<QueryResult, AppError> {
        let timeout = Self::query_timeout(snapshot, query);
        let values: Vec<BoundValue> = bound.iter().map(|(_, v)| v.clone()).collect();
        let mut session = self.connections.acquire(&query.database).await?;

        let started = Instant::now();
        let affected = match tokio::time::timeout(timeout, session.execute(&query.sql, &values)).await {
            Ok(result) => result.map_err(|e| self.driver_error(query, bound, e))?,
            Err(_) => return Err(Self::timed_out(query, timeout)),
        };
        drop(session);

        tracing::info!(
            "Executed write query '{}' in {} ms ({} rows affected)",
            query.name,
            started.elapsed().as_millis(),
            affected
        );

        if !query.invalidates.is_empty() {
            if let Err(e) = self.cache.invalidate(&query.invalidates) {
                tracing::warn!("Query '{}' wrote but cache invalidation failed: {}", query.name, e);
            }
        }

        let mut row = Row::new();
        row.insert("affected_rows".to_string(), json!(affected));
        Ok(QueryResult::Simple {
            data: vec![row],
            cached: false,
        })
    }

    /// Run a row-returning statement, on the given session or a fresh one
    async fn run_read(
        &self,
        snapshot: &ConfigurationModel,
        query: &QueryConfig,
        sql: &str,
        bound: &[(String, BoundValue)],
        session: Option<&mut Box<dyn DatabaseSession>>,
    ) -> Result<RowSet, AppError> {
        let timeout = Self::query_timeout(snapshot, query);
        let values: Vec<BoundValue> = bound.iter().map(|(_, v)| v.clone()).collect();

        let mut owned;
        let session = match session {
            Some(session) => session,
            None => {
                owned = self.connections.acquire(&query.database).await?;
                &mut owned
            }
        };

        let started = Instant::now();
        let rows = match tokio::time::timeout(timeout, session.query(sql, &values)).await {
            Ok(result) => result.map_err(|e| self.driver_error(query, bound, e))?,
            Err(_) => return Err(Self::timed_out(query, timeout)),
        };
        let execution_time_ms = started.elapsed().as_millis() as u64;

        tracing::debug!(
            "Executed query '{}' in {} ms ({} rows)",
            query.name,
            execution_time_ms,
            rows.len()
        );

        Ok(RowSet {
            rows,
            execution_time_ms,
        })
    }

    fn query_timeout(snapshot: &ConfigurationModel, query: &QueryConfig) -> Duration {
        snapshot
            .database(&query.database)
            .map(|db| db.pool.query_timeout())
            .unwrap_or_else(|| Duration::from_secs(30))
    }

    fn timed_out(query: &QueryConfig, timeout: Duration) -> AppError {
        AppError::SqlExecution {
            query: query.name.clone(),
            message: format!("Query timeout after {} seconds", timeout.as_secs()),
        }
    }

    fn driver_error(&self, query: &QueryConfig, bound: &[(String, BoundValue)], error: DriverError) -> AppError {
        let message = sanitize_message(&error.to_string(), bound);
        tracing::warn!("Query '{}' failed: {}", query.name, message);
        AppError::SqlExecution {
            query: query.name.clone(),
            message,
        }
    }

    /// The single numeric value returned by a count query
    fn extract_count(count_query: &QueryConfig, rows: &[Row]) -> Result<u64, AppError> {
        let value = match rows {
            [row] if row.len() == 1 => row.values().next(),
            _ => None,
        };

        let count = match value {
            Some(Value::Number(n)) => n.as_u64().or_else(|| {
                n.as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                    .map(|f| f as u64)
            }),
            Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
            _ => None,
        };

        count.ok_or_else(|| AppError::SqlExecution {
            query: count_query.name.clone(),
            message: "Count query must return a single non-negative numeric value".to_string(),
        })
    }

    fn mark_cached(result: QueryResult) -> QueryResult {
        match result {
            QueryResult::Simple { data, .. } => QueryResult::Simple { data, cached: true },
            QueryResult::Paged { data, pagination, .. } => QueryResult::Paged {
                data,
                pagination,
                cached: true,
            },
        }
    }

    /// Apply the endpoint's response shape
    fn shape(endpoint: &ApiEndpointConfig, result: QueryResult) -> Result<QueryResult, AppError> {
        match (endpoint.response, result) {
            (ResponseShape::Single, QueryResult::Simple { mut data, cached }) => {
                if data.is_empty() {
                    return Err(AppError::NotFound(format!("No record found for endpoint '{}'", endpoint.name)));
                }
                data.truncate(1);
                Ok(QueryResult::Simple { data, cached })
            }
            (_, result) => Ok(result),
        }
    }
}

/// Replace bound parameter values in a driver message so client data never
/// reaches logs or responses
pub fn sanitize_message(message: &str, bound: &[(String, BoundValue)]) -> String {
    let mut values: Vec<String> = bound
        .iter()
        .filter_map(|(_, value)| value.to_text())
        .filter(|text| text.chars().count() >= 3)
        .collect();
    // Longest first so a value containing another is redacted whole
    values.sort_by_key(|v| std::cmp::Reverse(v.len()));

    values
        .iter()
        .fold(message.to_string(), |acc, value| acc.replace(value.as_str(), REDACTED))
}
