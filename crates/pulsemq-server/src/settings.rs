//! Server settings
//!
//! Loaded from an optional `config/pulsemq.{toml,yaml,json}` file and
//! `PULSEMQ_`-prefixed environment variables (`__` separates nested keys),
//! over built-in defaults, then validated once before anything starts.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use pulsemq_types::{validate_queue_name, DeliveryMethod, ErrorMode, QueueConfig};
use serde::Deserialize;
use thiserror::Error;

const LOG_LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid bind address: {0}")]
    BindIp(String),

    #[error("{field} must be between 1 and 65535, got {value}")]
    Port { field: &'static str, value: u32 },

    #[error("ack_timeout_seconds must be greater than 3 and less than 600, got {0}")]
    AckTimeout(u64),

    #[error("time_between_acks_seconds must be greater than 1 and less than 600, got {0}")]
    TimeBetweenAcks(u64),

    #[error("invalid log level {0:?}, expected one of DEBUG, INFO, WARNING, ERROR, CRITICAL")]
    LogLevel(String),

    #[error("max_unacked must be greater than 0")]
    MaxUnacked,

    #[error("invalid queue {name:?}: {reason}")]
    Queue { name: String, reason: String },
}

/// A queue created at startup. Unset fields fall back to the broker-wide
/// defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueSettings {
    pub name: String,
    #[serde(default)]
    pub max_unacked: Option<usize>,
    #[serde(default)]
    pub delivery_method: Option<DeliveryMethod>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub dead_letter_queue: Option<String>,
}

impl QueueSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_unacked: None,
            delivery_method: None,
            max_retries: None,
            dead_letter_queue: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_ip: String,
    pub bind_port: u32,
    pub admin_port: u32,
    pub ack_timeout_seconds: u64,
    pub time_between_acks_seconds: u64,
    pub log_level: String,
    /// Emit log lines as JSON objects
    pub log_json: bool,
    pub consumer_error_threshold: u32,
    pub consumer_error_timeout_seconds: u64,
    pub error_mode: ErrorMode,
    pub max_unacked: usize,
    pub delivery_method: DeliveryMethod,
    pub max_retries: u32,
    pub data_dir: PathBuf,
    pub snapshot_interval_seconds: u64,
    pub queues: Vec<QueueSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            bind_port: 7896,
            admin_port: 7897,
            ack_timeout_seconds: 10,
            time_between_acks_seconds: 3,
            log_level: "INFO".to_string(),
            log_json: false,
            consumer_error_threshold: 100,
            consumer_error_timeout_seconds: 30,
            error_mode: ErrorMode::Lenient,
            max_unacked: 100,
            delivery_method: DeliveryMethod::RoundRobin,
            max_retries: 5,
            data_dir: PathBuf::from("data"),
            snapshot_interval_seconds: 30,
            queues: vec![QueueSettings::named("default")],
        }
    }
}

impl Settings {
    /// Load from `config/pulsemq.*` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new("config/pulsemq"), false)
    }

    pub fn load_from(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path).required(required))
            .add_source(
                Environment::with_prefix("PULSEMQ")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check ranges and normalize the log level.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.bind_ip
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::BindIp(self.bind_ip.clone()))?;

        for (field, value) in [("bind_port", self.bind_port), ("admin_port", self.admin_port)] {
            if !(1..=65535).contains(&value) {
                return Err(ConfigError::Port { field, value });
            }
        }

        if !(self.ack_timeout_seconds > 3 && self.ack_timeout_seconds < 600) {
            return Err(ConfigError::AckTimeout(self.ack_timeout_seconds));
        }
        if !(self.time_between_acks_seconds > 1 && self.time_between_acks_seconds < 600) {
            return Err(ConfigError::TimeBetweenAcks(self.time_between_acks_seconds));
        }

        self.log_level = self.log_level.to_uppercase();
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::LogLevel(self.log_level.clone()));
        }

        if self.max_unacked == 0 {
            return Err(ConfigError::MaxUnacked);
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            let invalid = |reason: &str| ConfigError::Queue {
                name: queue.name.clone(),
                reason: reason.to_string(),
            };
            validate_queue_name(&queue.name).map_err(|e| invalid(&e.to_string()))?;
            if !seen.insert(queue.name.as_str()) {
                return Err(invalid("declared twice"));
            }
            if queue.max_unacked == Some(0) {
                return Err(invalid("max_unacked must be greater than 0"));
            }
        }
        Ok(())
    }

    /// Directive for `tracing_subscriber::EnvFilter`
    pub fn tracing_level(&self) -> &'static str {
        match self.log_level.as_str() {
            "DEBUG" => "debug",
            "WARNING" => "warn",
            "ERROR" | "CRITICAL" => "error",
            _ => "info",
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.socket_addr(self.bind_port)
    }

    pub fn admin_addr(&self) -> SocketAddr {
        self.socket_addr(self.admin_port)
    }

    fn socket_addr(&self, port: u32) -> SocketAddr {
        let ip = self.bind_ip.parse().unwrap_or(IpAddr::from([0, 0, 0, 0]));
        SocketAddr::new(ip, u16::try_from(port).unwrap_or_default())
    }

    /// Engine configuration for one configured queue
    pub fn queue_config(&self, queue: &QueueSettings) -> QueueConfig {
        QueueConfig {
            max_unacked: queue.max_unacked.unwrap_or(self.max_unacked),
            ack_timeout_secs: self.ack_timeout_seconds,
            time_between_acks_secs: self.time_between_acks_seconds,
            delivery_method: queue.delivery_method.unwrap_or(self.delivery_method),
            max_retries: queue.max_retries.unwrap_or(self.max_retries),
            consumer_error_threshold: self.consumer_error_threshold,
            consumer_error_timeout_secs: self.consumer_error_timeout_seconds,
            snapshot_interval_secs: self.snapshot_interval_seconds,
            dead_letter_queue: queue.dead_letter_queue.clone(),
            ..QueueConfig::default()
        }
    }

    /// Broker-wide defaults for queues created through the admin API
    pub fn default_queue_config(&self) -> QueueConfig {
        self.queue_config(&QueueSettings::named(""))
    }
}
