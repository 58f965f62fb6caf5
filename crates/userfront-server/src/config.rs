use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};
use userfront_db_postgres::PostgresConfig;

use crate::cache::RedisSettings;
use crate::service::ServiceSettings;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pagination: PaginationSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 || self.server.monitoring_port == 0 {
            return Err("server.port and server.monitoring_port must be > 0".into());
        }
        if self.server.port == self.server.monitoring_port {
            return Err("server.monitoring_port must differ from server.port".into());
        }
        if self.server.request_timeout_ms == 0 {
            return Err("server.request_timeout_ms must be > 0".into());
        }
        // Pagination validations
        if self.pagination.default_limit == 0 {
            return Err("pagination.default_limit must be > 0".into());
        }
        if self.pagination.default_limit > self.pagination.max_limit {
            return Err("pagination.default_limit must be <= pagination.max_limit".into());
        }
        // Cache validations
        if self.cache.ttl_secs == 0 {
            return Err("cache.ttl_secs must be > 0".into());
        }
        if self.redis.enabled {
            if self.redis.url.is_empty() {
                return Err("redis.enabled=true requires redis.url".into());
            }
            if self.redis.dial_timeout_ms == 0 || self.redis.command_timeout_ms == 0 {
                return Err("redis timeouts must be > 0".into());
            }
        }
        // Storage validations
        if self.storage.backend == StorageBackend::Postgres {
            if self.storage.postgres.url.is_empty() {
                return Err("storage.postgres.url must not be empty".into());
            }
            if self.storage.postgres.pool_size == 0 {
                return Err("storage.postgres.pool_size must be > 0".into());
            }
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((self.host_ip(), self.server.port))
    }

    pub fn monitoring_addr(&self) -> SocketAddr {
        SocketAddr::from((self.host_ip(), self.server.monitoring_port))
    }

    fn host_ip(&self) -> std::net::IpAddr {
        use std::net::{IpAddr, Ipv4Addr};
        self.server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.server.request_timeout_ms)
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            upstream_timeout: self.request_timeout(),
            max_page_size: self.pagination.max_limit,
        }
    }

    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            url: self.redis.url.clone(),
            dial_timeout: Duration::from_millis(self.redis.dial_timeout_ms),
            command_timeout: Duration::from_millis(self.redis.command_timeout_ms),
            keepalive_interval: Duration::from_millis(self.redis.keepalive_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port for `/healthz`, `/readyz` and `/metrics`.
    #[serde(default = "default_monitoring_port")]
    pub monitoring_port: u16,
    /// Deadline given to every request, and the bound on each storage call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_monitoring_port() -> u16 {
    8081
}
fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_body_limit() -> usize {
    64 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            monitoring_port: default_monitoring_port(),
            request_timeout_ms: default_request_timeout_ms(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Postgres,
    /// Process-local storage, lost on restart.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

/// Redis connection settings. With `enabled = false` the server caches in
/// process memory instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_redis_timeout_ms")]
    pub dial_timeout_ms: u64,

    #[serde(default = "default_redis_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
}

fn default_redis_enabled() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_timeout_ms() -> u64 {
    100
}

fn default_keepalive_interval_ms() -> u64 {
    3_000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            dial_timeout_ms: default_redis_timeout_ms(),
            command_timeout_ms: default_redis_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of cache entries, reset on every hit.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    25
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationSettings {
    /// Page size when the `limit` parameter is absent or not positive.
    #[serde(default = "default_page_limit")]
    pub default_limit: i64,
    #[serde(default = "default_page_max")]
    pub max_limit: i64,
}
fn default_page_limit() -> i64 {
    10
}
fn default_page_max() -> i64 {
    100
}
impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            default_limit: default_page_limit(),
            max_limit: default_page_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::builder::DefaultState;
    use config::{Config, ConfigBuilder, ConfigError, Environment, File};
    use std::path::PathBuf;

    /// Plain environment variables understood for compatibility with older
    /// deployments. They act as defaults: the config file and `USERFRONT__*`
    /// variables win.
    pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
    pub const REDIS_ENV: &str = "REDIS";
    pub const LOG_LEVEL_ENV: &str = "APP_LOG_LEVEL";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        load_config_with_env(path, |name| std::env::var(name).ok())
    }

    pub fn load_config_with_env(
        path: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<AppConfig, String> {
        let mut builder =
            legacy_defaults(Config::builder(), &env).map_err(|e| format!("config default error: {e}"))?;
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if !pathbuf.exists() {
                    return Err(format!("config file not found: {p}"));
                }
                builder = builder.add_source(File::from(pathbuf));
            }
            None => {
                // Try default root-level file
                let default_path = PathBuf::from("userfront.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., USERFRONT__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("USERFRONT")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        // Validate
        merged.validate()?;
        Ok(merged)
    }

    fn legacy_defaults(
        mut builder: ConfigBuilder<DefaultState>,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        if let Some(url) = env(DATABASE_URL_ENV).filter(|v| !v.is_empty()) {
            builder = builder.set_default("storage.postgres.url", url)?;
        }
        if let Some(addr) = env(REDIS_ENV).filter(|v| !v.is_empty()) {
            let url = if addr.contains("://") {
                addr
            } else {
                format!("redis://{addr}")
            };
            builder = builder.set_default("redis.url", url)?;
        }
        if let Some(level) = env(LOG_LEVEL_ENV).filter(|v| !v.is_empty()) {
            builder = builder.set_default("logging.level", level.to_ascii_lowercase())?;
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::loader::load_config_with_env;
    use super::*;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.monitoring_port, 8081);
        assert_eq!(cfg.cache.ttl_secs, 25);
        assert_eq!(cfg.redis.dial_timeout_ms, 100);
        assert_eq!(cfg.redis.keepalive_interval_ms, 3000);
        assert_eq!(cfg.storage.postgres.connect_timeout_ms, 1000);

        let settings = cfg.service_settings();
        assert_eq!(settings.cache_ttl, Duration::from_secs(25));
        assert_eq!(settings.upstream_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = AppConfig::default();
        cfg.server.monitoring_port = cfg.server.port;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.pagination.default_limit = 500;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.storage.postgres.url.clear();
        assert!(cfg.validate().is_err());
        cfg.storage.backend = StorageBackend::Memory;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_legacy_env_fallbacks() {
        let env = |name: &str| match name {
            "DATABASE_URL" => Some("postgres://app:pw@db:5432/users".to_string()),
            "REDIS" => Some("cache:6379".to_string()),
            "APP_LOG_LEVEL" => Some("DEBUG".to_string()),
            _ => None,
        };
        let cfg = load_config_with_env(None, env).expect("config");
        assert_eq!(cfg.storage.postgres.url, "postgres://app:pw@db:5432/users");
        assert_eq!(cfg.redis.url, "redis://cache:6379");
        assert_eq!(cfg.logging.level, "debug");
    }

    #[test]
    fn test_file_overrides_legacy_env() {
        let path = std::env::temp_dir().join(format!("userfront-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[storage]\nbackend = \"memory\"\n\n[storage.postgres]\nurl = \"postgres://file/db\"\n\n[redis]\nenabled = false\n\n[cache]\nttl_secs = 60"
        )
        .unwrap();

        let env = |name: &str| (name == "DATABASE_URL").then(|| "postgres://env/db".to_string());
        let cfg = load_config_with_env(path.to_str(), env).expect("config");
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.storage.postgres.url, "postgres://file/db");
        assert_eq!(cfg.storage.postgres.pool_size, 10);
        assert!(!cfg.redis.enabled);
        assert_eq!(cfg.cache.ttl_secs, 60);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = load_config_with_env(Some("/nonexistent/userfront.toml"), no_env).unwrap_err();
        assert!(err.contains("not found"));
    }
}
