use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Engine settings. Declarations (databases, queries, endpoints) are not
/// settings; they come from the sources listed under `sources`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub sources: SourceSettings,
    pub validation: ValidationSettings,
    pub cache: CacheSettings,
    pub health: HealthSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    /// YAML files or directories, merged in order
    pub paths: Vec<PathBuf>,
    /// SQLite store holding declarations saved at runtime
    #[serde(default)]
    pub store_path: Option<String>,
}

/// What startup does with validation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Log errors and serve whatever is registerable
    Warn,
    /// Refuse to start
    #[serde(alias = "fail-fast")]
    FailFast,
    /// Validate, report, and exit
    #[serde(alias = "validate-only")]
    ValidateOnly,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationSettings {
    pub mode: ValidationMode,
    /// Probe every registered route over HTTP once the server is listening
    pub endpoint_check: bool,
    pub endpoint_timeout_secs: u64,
}

impl ValidationSettings {
    pub fn endpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    pub max_entries: usize,
    /// Zero disables the background sweeper
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    /// Minimum gap between on-demand probes of a failed database
    pub recheck_interval_secs: u64,
    /// Period of the background monitor; zero disables it
    pub monitor_interval_secs: u64,
}

impl HealthSettings {
    pub fn recheck_interval(&self) -> Duration {
        Duration::from_secs(self.recheck_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

/// Environment variables that override settings, with their target keys
const ENV_OVERRIDES: [(&str, &str); 6] = [
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("API_CONFIG_PATHS", "sources.paths"),
    ("API_CONFIG_STORE", "sources.store_path"),
    ("VALIDATION_MODE", "validation.mode"),
    ("RUST_LOG", "logging.level"),
];

impl Settings {
    /// Defaults, then an optional `engine.{yaml,toml}`, then the environment
    /// (including a `.env` file)
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let _ = dotenv::dotenv();

        let overrides: Vec<(&str, String)> = ENV_OVERRIDES
            .iter()
            .filter_map(|(var, key)| env::var(var).ok().map(|value| (*key, value)))
            .collect();

        Self::build(Some("engine"), &overrides)
    }

    /// Build from an optional settings file (name without extension) and
    /// explicit `key = value` overrides
    pub fn build(file: Option<&str>, overrides: &[(&str, String)]) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("sources.paths", vec!["config".to_string()])?
            .set_default("validation.mode", "warn")?
            .set_default("validation.endpoint_check", false)?
            .set_default("validation.endpoint_timeout_secs", 10)?
            .set_default("cache.max_entries", 10_000)?
            .set_default("cache.sweep_interval_secs", 60)?
            .set_default("health.recheck_interval_secs", 5)?
            .set_default("health.monitor_interval_secs", 30)?
            .set_default("logging.level", "info")?;

        if let Some(file) = file {
            builder = builder.add_source(config::File::with_name(file).required(false));
        }

        for (key, value) in overrides {
            builder = match *key {
                "sources.paths" => {
                    let paths: Vec<String> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect();
                    builder.set_override(*key, paths)?
                }
                "server.port" => {
                    let port = value.trim().parse::<u16>().map_err(|_| {
                        config::ConfigError::Message(format!("PORT must be a port number, got '{}'", value))
                    })?;
                    builder.set_override(*key, i64::from(port))?
                }
                _ => builder.set_override(*key, value.as_str())?,
            };
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
