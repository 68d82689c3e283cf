//! Configuration for the HMAC server.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use remote_hmac_core::{EngineConfig, ExecutionMode};
use remote_hmac_telemetry::{LogConfig, LogFormat, MetricsConfig, TelemetryConfig};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "REMOTE_HMAC_";

/// Path prefix reserved for internal endpoints.
pub const INTERNAL_PREFIX: &str = "/_hmac/";

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener and HTTP settings.
    pub server: ServerSettings,
    /// Batch engine settings.
    pub engine: EngineConfig,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
}

impl ServerConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Load configuration from a TOML or JSON file.
    pub fn from_file(path: impl Into<PathBuf>) -> ServerResult<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ServerError::config(format!("failed to read config file: {e}")))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        match extension {
            "toml" => {
                toml::from_str(&content).map_err(|e| ServerError::config(format!("invalid TOML: {e}")))
            }
            "json" => serde_json::from_str(&content)
                .map_err(|e| ServerError::config(format!("invalid JSON: {e}"))),
            _ => Err(ServerError::config(format!(
                "unsupported config format: {extension}"
            ))),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Variables are prefixed with `REMOTE_HMAC_`. Values that fail to parse
    /// are ignored.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Apply overrides from an arbitrary lookup keyed by the unprefixed name.
    #[must_use]
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }

        if let Some(port) = lookup("LISTEN_PORT") {
            if let Ok(port) = port.parse() {
                self.server.listen_port = port;
            }
        }

        if let Some(path) = lookup("FUNCTION_PATH") {
            self.server.function_path = path;
        }

        if let Some(mode) = lookup("ENGINE_MODE") {
            match mode.to_ascii_lowercase().as_str() {
                "parallel" => self.engine.mode = ExecutionMode::Parallel,
                "sequential" => self.engine.mode = ExecutionMode::Sequential,
                _ => {}
            }
        }

        if let Some(limit) = lookup("MAX_CONCURRENCY") {
            if let Ok(limit) = limit.parse() {
                self.engine.max_concurrency = limit;
            }
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.telemetry.log_level = level;
        }

        if let Some(format) = lookup("LOG_FORMAT") {
            if let Ok(format) = format.parse() {
                self.telemetry.log_format = format;
            }
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ServerResult<()> {
        self.socket_addr()?;

        let path = &self.server.function_path;
        if !path.starts_with('/') {
            return Err(ServerError::config("function_path must start with '/'"));
        }
        if path.starts_with(INTERNAL_PREFIX) {
            return Err(ServerError::config(format!(
                "function_path must not be under {INTERNAL_PREFIX}"
            )));
        }

        if self.server.max_request_body_size == 0 {
            return Err(ServerError::config(
                "max_request_body_size must be greater than zero",
            ));
        }

        if self.telemetry.service_name.is_empty() {
            return Err(ServerError::config("service_name must not be empty"));
        }

        remote_hmac_telemetry::logging::create_env_filter(&self.telemetry.log_level)
            .map_err(|e| ServerError::config(e.to_string()))?;

        Ok(())
    }

    /// Resolved listen address.
    pub fn socket_addr(&self) -> ServerResult<SocketAddr> {
        let ip: IpAddr = self
            .server
            .listen_addr
            .parse()
            .map_err(|e| ServerError::config(format!("invalid listen address: {e}")))?;
        Ok(SocketAddr::new(ip, self.server.listen_port))
    }

    /// Telemetry configuration derived from these settings.
    pub fn telemetry_config(&self) -> TelemetryConfig {
        let settings = &self.telemetry;
        TelemetryConfig::builder()
            .service_name(&settings.service_name)
            .logging(LogConfig {
                level: settings.log_level.clone(),
                format: settings.log_format,
                ..LogConfig::production()
            })
            .metrics(MetricsConfig {
                enabled: settings.metrics_enabled,
                ..MetricsConfig::default()
            })
            .build()
    }
}

/// Listener and HTTP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to.
    pub listen_addr: String,
    /// Port to listen on. `0` picks an ephemeral port.
    pub listen_port: u16,
    /// Path the remote-function caller posts batches to.
    pub function_path: String,
    /// Maximum request body size in bytes.
    pub max_request_body_size: usize,
    /// How long to wait for open connections on shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 8080,
            function_path: "/".to_string(),
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Service name for logs and metrics.
    pub service_name: String,
    /// Log filter directive.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Whether the Prometheus recorder is installed.
    pub metrics_enabled: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            service_name: "remote-hmac".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            metrics_enabled: true,
        }
    }
}

/// Builder for `ServerConfig`.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set the listen address.
    #[must_use]
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server.listen_addr = addr.into();
        self
    }

    /// Set the listen port.
    #[must_use]
    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.server.listen_port = port;
        self
    }

    /// Set the function path.
    #[must_use]
    pub fn function_path(mut self, path: impl Into<String>) -> Self {
        self.config.server.function_path = path.into();
        self
    }

    /// Set the maximum request body size.
    #[must_use]
    pub fn max_request_body_size(mut self, size: usize) -> Self {
        self.config.server.max_request_body_size = size;
        self
    }

    /// Set the shutdown drain timeout.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.server.shutdown_timeout = timeout;
        self
    }

    /// Set the engine configuration.
    #[must_use]
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.config.engine = engine;
        self
    }

    /// Set the service name.
    #[must_use]
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.telemetry.service_name = name.into();
        self
    }

    /// Set the log level.
    #[must_use]
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.telemetry.log_level = level.into();
        self
    }

    /// Set the log format.
    #[must_use]
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.telemetry.log_format = format;
        self
    }

    /// Enable or disable metrics.
    #[must_use]
    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.config.telemetry.metrics_enabled = enabled;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ServerResult<ServerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Duration (de)serialization in a humantime-like format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        let s = if millis % 1000 == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{millis}ms")
        };
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, scale): (&str, fn(u64) -> Duration) = if let Some(n) = s.strip_suffix("ms") {
            (n, Duration::from_millis)
        } else if let Some(n) = s.strip_suffix('s') {
            (n, Duration::from_secs)
        } else if let Some(n) = s.strip_suffix('m') {
            (n, |n| Duration::from_secs(n.saturating_mul(60)))
        } else if let Some(n) = s.strip_suffix('h') {
            (n, |n| Duration::from_secs(n.saturating_mul(3600)))
        } else {
            // Bare numbers are seconds.
            (s, Duration::from_secs)
        };

        let n: u64 = digits
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;
        Ok(scale(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.listen_port, 8080);
        assert_eq!(config.server.function_path, "/");
        assert_eq!(config.server.max_request_body_size, 10 * 1024 * 1024);
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.mode, ExecutionMode::Parallel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::builder()
            .listen_addr("127.0.0.1")
            .listen_port(9000)
            .function_path("/hmac")
            .engine(EngineConfig::sequential())
            .shutdown_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(config.socket_addr().unwrap().to_string(), "127.0.0.1:9000");
        assert_eq!(config.server.function_path, "/hmac");
        assert_eq!(config.engine.mode, ExecutionMode::Sequential);
    }

    #[test]
    fn test_config_validation() {
        assert!(ServerConfig::builder().listen_addr("not-an-ip").build().is_err());
        assert!(ServerConfig::builder().function_path("hmac").build().is_err());
        assert!(ServerConfig::builder()
            .function_path("/_hmac/health")
            .build()
            .is_err());
        assert!(ServerConfig::builder().max_request_body_size(0).build().is_err());
        assert!(ServerConfig::builder().service_name("").build().is_err());
        assert!(ServerConfig::builder()
            .log_level("remote_hmac=notalevel")
            .build()
            .is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LISTEN_ADDR", "127.0.0.1"),
            ("LISTEN_PORT", "9999"),
            ("FUNCTION_PATH", "/udf"),
            ("ENGINE_MODE", "Sequential"),
            ("MAX_CONCURRENCY", "4"),
            ("LOG_LEVEL", "debug"),
            ("LOG_FORMAT", "pretty"),
        ]
        .into_iter()
        .collect();

        let config = ServerConfig::default()
            .with_overrides(|name| vars.get(name).map(ToString::to_string));

        assert_eq!(config.server.listen_addr, "127.0.0.1");
        assert_eq!(config.server.listen_port, 9999);
        assert_eq!(config.server.function_path, "/udf");
        assert_eq!(config.engine.mode, ExecutionMode::Sequential);
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.telemetry.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_unparsable_overrides_ignored() {
        let config = ServerConfig::default().with_overrides(|name| match name {
            "LISTEN_PORT" => Some("eighty".to_string()),
            "ENGINE_MODE" => Some("turbo".to_string()),
            "LOG_FORMAT" => Some("xml".to_string()),
            _ => None,
        });

        assert_eq!(config.server.listen_port, 8080);
        assert_eq!(config.engine.mode, ExecutionMode::Parallel);
        assert_eq!(config.telemetry.log_format, LogFormat::Json);
    }

    #[test]
    fn test_toml_config() {
        let toml = r#"
[server]
listen_port = 8181
function_path = "/hmac"
shutdown_timeout = "500ms"

[engine]
mode = "sequential"

[telemetry]
service_name = "hmac-test"
log_format = "pretty"
"#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_port, 8181);
        assert_eq!(config.server.listen_addr, "0.0.0.0");
        assert_eq!(config.server.shutdown_timeout, Duration::from_millis(500));
        assert_eq!(config.engine.mode, ExecutionMode::Sequential);
        assert_eq!(config.engine.max_concurrency, 0);
        assert_eq!(config.telemetry.service_name, "hmac-test");
        assert_eq!(config.telemetry.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_json_config() {
        let json = r#"{"server": {"listen_port": 7000}, "engine": {"max_concurrency": 2}}"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.listen_port, 7000);
        assert_eq!(config.engine.max_concurrency, 2);
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let err = ServerConfig::from_file("/nonexistent/config.yaml").unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_parse_duration() {
        use humantime_serde::parse_duration;

        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration(" 7 "), Ok(Duration::from_secs(7)));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_telemetry_config() {
        let config = ServerConfig::builder()
            .service_name("hmac-eu")
            .log_level("warn")
            .metrics_enabled(false)
            .build()
            .unwrap();

        let telemetry = config.telemetry_config();
        assert_eq!(telemetry.service_name, "hmac-eu");
        assert_eq!(telemetry.logging.level, "warn");
        assert_eq!(telemetry.metrics.service_name, "hmac-eu");
        assert!(!telemetry.metrics.enabled);
    }
}
