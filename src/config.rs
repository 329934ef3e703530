use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BlackboxConfig {
    pub service: ServiceConfig,
    pub push: PushConfig,
    pub loki: LokiConfig,
    pub scrape: ScrapeConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Service name used as the push job name and metric label
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Instance identifier used as the push grouping key; generated when empty
    #[serde(default)]
    pub instance: String,

    /// Environment label attached to outgoing log streams
    #[serde(default = "default_environment")]
    pub environment: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PushConfig {
    /// Base URL of the push-style metrics aggregator
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LokiConfig {
    /// Base URL of the log ingestion endpoint
    #[serde(default = "default_loki_url")]
    pub url: String,

    /// Interval between background batch forwards in milliseconds
    #[serde(default = "default_forward_interval_ms")]
    pub forward_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScrapeConfig {
    /// IP address to bind the scrape endpoint to
    #[serde(default = "default_scrape_ip")]
    pub ip: String,

    /// Port for the scrape endpoint
    #[serde(default = "default_scrape_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ShutdownConfig {
    /// Deadline for the metrics publish step in milliseconds
    #[serde(default = "default_publish_deadline_ms")]
    pub publish_deadline_ms: u64,

    /// Aggregate deadline for draining log transports in milliseconds
    #[serde(default = "default_flush_deadline_ms")]
    pub flush_deadline_ms: u64,

    /// Grace delay for transports without an explicit flush, in milliseconds
    #[serde(default = "default_transport_grace_ms")]
    pub transport_grace_ms: u64,

    /// Absolute watchdog bound on the whole shutdown sequence in milliseconds
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
}

impl ShutdownConfig {
    pub fn publish_deadline(&self) -> Duration {
        Duration::from_millis(self.publish_deadline_ms)
    }

    pub fn flush_deadline(&self) -> Duration {
        Duration::from_millis(self.flush_deadline_ms)
    }

    pub fn transport_grace(&self) -> Duration {
        Duration::from_millis(self.transport_grace_ms)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }
}

impl BlackboxConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("blackbox.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("service.name", default_service_name())?
            .set_default("service.instance", "")?
            .set_default("service.environment", default_environment())?
            .set_default("push.gateway_url", default_gateway_url())?
            .set_default("loki.url", default_loki_url())?
            .set_default(
                "loki.forward_interval_ms",
                default_forward_interval_ms() as i64,
            )?
            .set_default("scrape.ip", default_scrape_ip())?
            .set_default("scrape.port", default_scrape_port())?
            .set_default(
                "shutdown.publish_deadline_ms",
                default_publish_deadline_ms() as i64,
            )?
            .set_default(
                "shutdown.flush_deadline_ms",
                default_flush_deadline_ms() as i64,
            )?
            .set_default(
                "shutdown.transport_grace_ms",
                default_transport_grace_ms() as i64,
            )?
            .set_default("shutdown.watchdog_ms", default_watchdog_ms() as i64)?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with BLACKBOX__ prefix
            .add_source(
                Environment::with_prefix("BLACKBOX")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let mut config: BlackboxConfig = settings.try_deserialize()?;

        if config.service.instance.is_empty() {
            config.service.instance = generate_instance_id();
        }

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.is_empty() {
            return Err(ConfigError::Message(
                "Service name must not be empty".to_string(),
            ));
        }

        if !self.push.gateway_url.starts_with("http") {
            return Err(ConfigError::Message(
                "Push gateway URL must be an http(s) URL".to_string(),
            ));
        }

        if !self.loki.url.starts_with("http") {
            return Err(ConfigError::Message(
                "Log sink URL must be an http(s) URL".to_string(),
            ));
        }

        if self.scrape.port == 0 {
            return Err(ConfigError::Message(
                "Scrape port must be greater than 0".to_string(),
            ));
        }

        if self.shutdown.publish_deadline_ms == 0 || self.shutdown.flush_deadline_ms == 0 {
            return Err(ConfigError::Message(
                "Shutdown step deadlines must be greater than 0".to_string(),
            ));
        }

        if self.shutdown.watchdog_ms == 0 {
            return Err(ConfigError::Message(
                "Shutdown watchdog must be greater than 0".to_string(),
            ));
        }

        if self.shutdown.transport_grace_ms >= self.shutdown.flush_deadline_ms {
            return Err(ConfigError::Message(
                "Transport grace delay must be shorter than the flush deadline".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for BlackboxConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: default_service_name(),
                instance: generate_instance_id(),
                environment: default_environment(),
            },
            push: PushConfig {
                gateway_url: default_gateway_url(),
            },
            loki: LokiConfig {
                url: default_loki_url(),
                forward_interval_ms: default_forward_interval_ms(),
            },
            scrape: ScrapeConfig {
                ip: default_scrape_ip(),
                port: default_scrape_port(),
            },
            shutdown: ShutdownConfig {
                publish_deadline_ms: default_publish_deadline_ms(),
                flush_deadline_ms: default_flush_deadline_ms(),
                transport_grace_ms: default_transport_grace_ms(),
                watchdog_ms: default_watchdog_ms(),
            },
        }
    }
}

/// Build a stable-enough instance id when none is configured
fn generate_instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

// Default value functions
fn default_service_name() -> String {
    "blackbox".to_string()
}
fn default_environment() -> String {
    "production".to_string()
}
fn default_gateway_url() -> String {
    "http://127.0.0.1:9091".to_string()
}
fn default_loki_url() -> String {
    "http://127.0.0.1:3100".to_string()
}
fn default_forward_interval_ms() -> u64 {
    1000
}
fn default_scrape_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_scrape_port() -> u16 {
    9464
}
fn default_publish_deadline_ms() -> u64 {
    2000
}
fn default_flush_deadline_ms() -> u64 {
    3000
}
fn default_transport_grace_ms() -> u64 {
    500
}
fn default_watchdog_ms() -> u64 {
    8000
}
