use octofhir_bulk::{FailurePolicy, PollRateLimiter};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Bulk data export engine settings
    #[serde(default)]
    pub bulk_export: BulkExportConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        let bulk = &self.bulk_export;
        if bulk.workers == 0 {
            return Err("bulk_export.workers must be > 0".into());
        }
        if bulk.batch_size == 0 {
            return Err("bulk_export.batch_size must be > 0".into());
        }
        if bulk.retry_after_secs == 0 {
            return Err("bulk_export.retry_after_secs must be > 0".into());
        }
        if bulk.job_timeout_secs == Some(0) {
            return Err("bulk_export.job_timeout_secs must be > 0 when set".into());
        }
        if bulk.export_path.as_os_str().is_empty() {
            return Err("bulk_export.export_path must not be empty".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    /// Returns the base URL for the server.
    /// If `base_url` is configured, returns that; otherwise computes from host:port.
    pub fn base_url(&self) -> String {
        self.server
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.server.host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL for the server, used in `Content-Location` and manifest links.
    /// If not set, defaults to http://{host}:{port}
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: None,
            body_limit_bytes: default_body_limit(),
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkExportConfig {
    /// Root directory; each job writes to `<export_path>/<job_id>/`.
    #[serde(default = "default_export_path")]
    pub export_path: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Page size used when reading from the store
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
    /// Polls tolerated within one retry window before answering 429
    #[serde(default = "default_request_tolerance")]
    pub request_tolerance: u32,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Unbounded when absent
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
    #[serde(default)]
    pub requires_access_token: bool,
}

fn default_export_path() -> PathBuf {
    PathBuf::from("./bulk-export")
}
fn default_workers() -> usize {
    2
}
fn default_batch_size() -> usize {
    500
}
fn default_retry_after_secs() -> u64 {
    octofhir_bulk::rate_limit::DEFAULT_RETRY_AFTER_SECS
}
fn default_request_tolerance() -> u32 {
    octofhir_bulk::rate_limit::DEFAULT_REQUEST_TOLERANCE
}

impl Default for BulkExportConfig {
    fn default() -> Self {
        Self {
            export_path: default_export_path(),
            workers: default_workers(),
            batch_size: default_batch_size(),
            retry_after_secs: default_retry_after_secs(),
            request_tolerance: default_request_tolerance(),
            failure_policy: FailurePolicy::default(),
            job_timeout_secs: None,
            requires_access_token: false,
        }
    }
}

impl BulkExportConfig {
    pub fn limiter(&self) -> PollRateLimiter {
        PollRateLimiter::new(self.retry_after_secs, self.request_tolerance)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "octofhir-bulk.toml";
    pub const ENV_PREFIX: &str = "OCTOFHIR_BULK";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        let mut builder = Config::builder();
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., OCTOFHIR_BULK__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
