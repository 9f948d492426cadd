use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use crate::api::middleware::AppError;
use crate::models::{ApiEndpointConfig, ConfigDocument, ConfigurationModel, DatabaseConfig, QueryConfig};
use crate::services::database::DatabaseType;
use crate::storage::ConfigStore;

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").expect("static regex")
});

/// Expand `${VAR}` and `${VAR:default}` from the process environment
pub fn expand_env(text: &str, origin: &str) -> Result<String, AppError> {
    let mut missing = Vec::new();
    let expanded = ENV_REFERENCE.replace_all(text, |caps: &Captures| {
        let var = &caps[1];
        match (std::env::var(var), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.push(var.to_string());
                String::new()
            }
        }
    });

    if missing.is_empty() {
        Ok(expanded.into_owned())
    } else {
        Err(AppError::ConfigLoad(format!(
            "{}: environment variable(s) not set: {}",
            origin,
            missing.join(", ")
        )))
    }
}

/// Parse one YAML document after environment expansion
pub fn parse_yaml(text: &str, origin: &str) -> Result<ConfigDocument, AppError> {
    let expanded = expand_env(text, origin)?;
    if expanded.trim().is_empty() {
        return Ok(ConfigDocument::default());
    }
    serde_yaml::from_str::<ConfigDocument>(&expanded)
        .map(ConfigDocument::with_names)
        .map_err(|e| AppError::ConfigLoad(format!("{}: {}", origin, e)))
}

/// A named origin of configuration documents
#[async_trait::async_trait]
pub trait ConfigSource: Send + Sync {
    fn name(&self) -> String;

    /// Every document this source provides, each with the name used in
    /// diagnostics
    async fn documents(&self) -> Result<Vec<(String, ConfigDocument)>, AppError>;
}

/// A YAML file, or a directory whose `*.yaml` / `*.yml` files are read in
/// file-name order
pub struct YamlFileSource {
    path: PathBuf,
}

impl YamlFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(path: &Path) -> Result<(String, ConfigDocument), AppError> {
        let origin = path.display().to_string();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::ConfigLoad(format!("Failed to read {}: {}", origin, e)))?;
        let document = parse_yaml(&text, &origin)?;
        Ok((origin, document))
    }
}

#[async_trait::async_trait]
impl ConfigSource for YamlFileSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    async fn documents(&self) -> Result<Vec<(String, ConfigDocument)>, AppError> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| AppError::ConfigLoad(format!("Cannot access {}: {}", self.name(), e)))?;

        if !metadata.is_dir() {
            return Ok(vec![Self::read(&self.path).await?]);
        }

        let mut files = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.path)
            .await
            .map_err(|e| AppError::ConfigLoad(format!("Cannot list {}: {}", self.name(), e)))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| AppError::ConfigLoad(format!("Cannot list {}: {}", self.name(), e)))?
        {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
                .unwrap_or(false);
            if is_yaml && path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let mut documents = Vec::with_capacity(files.len());
        for path in files {
            documents.push(Self::read(&path).await?);
        }
        Ok(documents)
    }
}

/// YAML held in memory
pub struct YamlTextSource {
    name: String,
    text: String,
}

impl YamlTextSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

#[async_trait::async_trait]
impl ConfigSource for YamlTextSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn documents(&self) -> Result<Vec<(String, ConfigDocument)>, AppError> {
        Ok(vec![(self.name.clone(), parse_yaml(&self.text, &self.name)?)])
    }
}

/// Definitions persisted in the SQLite configuration store
pub struct SqliteStoreSource {
    store: Arc<ConfigStore>,
    name: String,
}

impl SqliteStoreSource {
    pub fn new(store: Arc<ConfigStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl ConfigSource for SqliteStoreSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn documents(&self) -> Result<Vec<(String, ConfigDocument)>, AppError> {
        let document = self
            .store
            .load_document()
            .await
            .map_err(|e| AppError::ConfigLoad(format!("{}: {}", self.name, e)))?;
        Ok(vec![(self.name.clone(), document)])
    }
}

/// Merges every configured source into one [`ConfigurationModel`]
#[derive(Default)]
pub struct ConfigurationLoader {
    sources: Vec<Box<dyn ConfigSource>>,
}

impl ConfigurationLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl ConfigSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn add_source(&mut self, source: Box<dyn ConfigSource>) {
        self.sources.push(source);
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Read every source and merge into one namespace per kind. A name
    /// declared twice, in one source or across sources, is an error.
    pub async fn load(&self) -> Result<ConfigurationModel, AppError> {
        let mut databases: BTreeMap<String, DatabaseConfig> = BTreeMap::new();
        let mut queries: BTreeMap<String, QueryConfig> = BTreeMap::new();
        let mut endpoints: BTreeMap<String, ApiEndpointConfig> = BTreeMap::new();
        let mut origins: BTreeMap<String, String> = BTreeMap::new();

        for source in &self.sources {
            for (origin, document) in source.documents().await? {
                check_structure(&document, &origin)?;

                merge(&mut databases, &mut origins, "database", document.databases, &origin)?;
                merge(&mut queries, &mut origins, "query", document.queries, &origin)?;
                merge(&mut endpoints, &mut origins, "endpoint", document.endpoints, &origin)?;
            }
        }

        let model = ConfigurationModel::from_parts(databases, queries, endpoints, origins);
        tracing::info!("Loaded configuration: {}", model.summary());
        Ok(model)
    }
}

fn merge<T>(
    target: &mut BTreeMap<String, T>,
    origins: &mut BTreeMap<String, String>,
    kind: &str,
    incoming: BTreeMap<String, T>,
    origin: &str,
) -> Result<(), AppError> {
    for (name, item) in incoming {
        let origin_key = format!("{}/{}", kind, name);
        if let Some(first) = origins.get(&origin_key) {
            return Err(AppError::ConfigLoad(format!(
                "Duplicate {} '{}' declared in '{}' and '{}'",
                kind, name, first, origin
            )));
        }
        origins.insert(origin_key, origin.to_string());
        target.insert(name, item);
    }
    Ok(())
}

/// Shape checks that need no other record
fn check_structure(document: &ConfigDocument, origin: &str) -> Result<(), AppError> {
    let fail = |message: String| Err(AppError::ConfigLoad(format!("{}: {}", origin, message)));

    for (name, db) in &document.databases {
        if name.trim().is_empty() {
            return fail("database with an empty name".to_string());
        }
        if db.url.trim().is_empty() {
            return fail(format!("database '{}' has an empty url", name));
        }
        DatabaseType::resolve(db).map_err(|e| AppError::ConfigLoad(format!("{}: {}", origin, e)))?;
        if db.pool.max_connections == 0 || db.pool.min_connections > db.pool.max_connections {
            return fail(format!(
                "database '{}' has invalid pool bounds (min {}, max {})",
                name, db.pool.min_connections, db.pool.max_connections
            ));
        }
    }

    for (name, query) in &document.queries {
        if name.trim().is_empty() {
            return fail("query with an empty name".to_string());
        }
        if query.sql.trim().is_empty() {
            return fail(format!("query '{}' has empty sql", name));
        }
        if query.database.trim().is_empty() {
            return fail(format!("query '{}' names no database", name));
        }
        let mut seen = HashSet::new();
        for param in &query.parameters {
            if param.name.trim().is_empty() {
                return fail(format!("query '{}' declares a parameter without a name", name));
            }
            if !seen.insert(param.name.as_str()) {
                return fail(format!("query '{}' declares parameter '{}' twice", name, param.name));
            }
        }
    }

    for (name, endpoint) in &document.endpoints {
        if name.trim().is_empty() {
            return fail("endpoint with an empty name".to_string());
        }
        if !endpoint.path.starts_with('/') {
            return fail(format!("endpoint '{}' path '{}' must start with '/'", name, endpoint.path));
        }
        if endpoint.query.trim().is_empty() {
            return fail(format!("endpoint '{}' names no query", name));
        }
        if let Some(pagination) = &endpoint.pagination {
            if pagination.default_size == 0 || pagination.max_size == 0 || pagination.default_size > pagination.max_size {
                return fail(format!(
                    "endpoint '{}' has invalid pagination sizes (default {}, max {})",
                    name, pagination.default_size, pagination.max_size
                ));
            }
        }
    }

    Ok(())
}

/// Holds the current configuration snapshot. Readers clone the `Arc` and
/// keep using it; a reload swaps in a new snapshot.
pub struct ConfigHandle {
    loader: Option<ConfigurationLoader>,
    current: RwLock<Arc<ConfigurationModel>>,
}

impl ConfigHandle {
    pub async fn load(loader: ConfigurationLoader) -> Result<Self, AppError> {
        let model = loader.load().await?;
        Ok(Self {
            loader: Some(loader),
            current: RwLock::new(Arc::new(model)),
        })
    }

    /// Fixed snapshot without sources; `reload` is not available
    pub fn from_model(model: ConfigurationModel) -> Self {
        Self {
            loader: None,
            current: RwLock::new(Arc::new(model)),
        }
    }

    pub fn snapshot(&self) -> Arc<ConfigurationModel> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Re-read all sources and swap the snapshot. On failure the previous
    /// snapshot stays in place.
    pub async fn reload(&self) -> Result<Arc<ConfigurationModel>, AppError> {
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| AppError::ConfigLoad("No configuration sources to reload from".to_string()))?;

        let model = Arc::new(loader.load().await?);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = model.clone();
        tracing::info!("Configuration reloaded: {}", model.summary());
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DATABASES: &str = r#"
databases:
  trades:
    url: "sqlite::memory:"
"#;

    const QUERIES: &str = r#"
queries:
  get_trades_by_symbol:
    database: trades
    sql: SELECT * FROM stock_trades WHERE symbol = ?
    parameters:
      - name: symbol
        type: STRING
        required: true
endpoints:
  trades-by-symbol:
    path: /api/trades/{symbol}
    query: get_trades_by_symbol
"#;

    #[tokio::test]
    async fn test_merges_sources() {
        let loader = ConfigurationLoader::new()
            .with_source(YamlTextSource::new("databases.yaml", DATABASES))
            .with_source(YamlTextSource::new("queries.yaml", QUERIES));

        let model = loader.load().await.unwrap();
        assert!(model.database("trades").is_some());
        assert_eq!(model.query("get_trades_by_symbol").unwrap().parameters.len(), 1);
        assert_eq!(model.origin_of("query", "get_trades_by_symbol"), Some("queries.yaml"));
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let loader = ConfigurationLoader::new()
            .with_source(YamlTextSource::new("a.yaml", DATABASES))
            .with_source(YamlTextSource::new("b.yaml", DATABASES));

        let err = loader.load().await.unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, AppError::ConfigLoad(_)));
        assert!(message.contains("trades"));
        assert!(message.contains("a.yaml") && message.contains("b.yaml"));
    }

    #[tokio::test]
    async fn test_directory_source() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("01-databases.yaml"), DATABASES).unwrap();
        std::fs::write(dir.path().join("02-queries.yml"), QUERIES).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let model = ConfigurationLoader::new()
            .with_source(YamlFileSource::new(dir.path()))
            .load()
            .await
            .unwrap();
        assert_eq!(model.summary(), "1 databases, 1 queries, 1 endpoints");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = ConfigurationLoader::new()
            .with_source(YamlFileSource::new("/definitely/not/here.yaml"))
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigLoad(_)));
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("DYN_API_TEST_DB_HOST", "db.internal");
        let text = "url: postgres://${DYN_API_TEST_DB_HOST}:${DYN_API_TEST_DB_PORT:5432}/trades";
        assert_eq!(
            expand_env(text, "test").unwrap(),
            "url: postgres://db.internal:5432/trades"
        );
        assert!(expand_env("${DYN_API_TEST_SURELY_UNSET}", "test").is_err());
        assert_eq!(expand_env("url: \"sqlite::memory:\"", "test").unwrap(), "url: \"sqlite::memory:\"");
    }

    #[test]
    fn test_structural_checks() {
        let bad_path = "endpoints:\n  e:\n    path: trades\n    query: q\n";
        assert!(check_structure(&parse_yaml(bad_path, "t").unwrap(), "t").is_err());

        let bad_driver = "databases:\n  d:\n    url: \"oracle://host/db\"\n";
        assert!(check_structure(&parse_yaml(bad_driver, "t").unwrap(), "t").is_err());

        let bad_page = "endpoints:\n  e:\n    path: /t\n    query: q\n    pagination:\n      default_size: 50\n      max_size: 10\n";
        assert!(check_structure(&parse_yaml(bad_page, "t").unwrap(), "t").is_err());

        let twice = "queries:\n  q:\n    database: d\n    sql: SELECT ?\n    parameters:\n      - name: a\n      - name: a\n";
        assert!(check_structure(&parse_yaml(twice, "t").unwrap(), "t").is_err());

        assert!(parse_yaml("   \n", "empty").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reload_swaps_snapshot() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("api.yaml");
        std::fs::write(&file, DATABASES).unwrap();

        let handle = ConfigHandle::load(ConfigurationLoader::new().with_source(YamlFileSource::new(&file)))
            .await
            .unwrap();
        let before = handle.snapshot();
        assert_eq!(before.queries().count(), 0);

        std::fs::write(&file, format!("{}{}", DATABASES, QUERIES)).unwrap();
        handle.reload().await.unwrap();

        // Earlier snapshot is unchanged; the new one sees the query
        assert_eq!(before.queries().count(), 0);
        assert_eq!(handle.snapshot().queries().count(), 1);

        std::fs::write(&file, "databases: [not, a, map]").unwrap();
        assert!(handle.reload().await.is_err());
        assert_eq!(handle.snapshot().queries().count(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_store_source() {
        let store = Arc::new(ConfigStore::new("sqlite::memory:").await.unwrap());
        let doc = parse_yaml(QUERIES, "seed").unwrap();
        for query in doc.queries.values() {
            store.save_query(query).await.unwrap();
        }

        let model = ConfigurationLoader::new()
            .with_source(YamlTextSource::new("databases.yaml", DATABASES))
            .with_source(SqliteStoreSource::new(store, "config-store"))
            .load()
            .await
            .unwrap();
        assert_eq!(model.origin_of("query", "get_trades_by_symbol"), Some("config-store"));
    }
}
