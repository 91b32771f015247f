//! # AMQP connection and topology configuration
//!
//! [`AmqpConfiguration`] is built once at process start, validated, and never
//! mutated afterwards. It can be loaded from the process environment
//! ([`AmqpConfiguration::from_environment`]), from a TOML file
//! ([`AmqpConfiguration::from_toml_file`]) or assembled in code through
//! [`AmqpConfiguration::builder`]. All three paths share the same validation.
//!
//! ## Environment variables
//!
//! | Variable          | Default                   |
//! |-------------------|---------------------------|
//! | `AMQP_HOST`       | required                  |
//! | `AMQP_PORT`       | `5672`                    |
//! | `AMQP_USER`       | required                  |
//! | `AMQP_PASS`       | none (base64 encoded)     |
//! | `AMQP_EXCHANGE`   | `pingboard`               |
//! | `AMQP_RK_STATUS`  | `status`                  |
//! | `AMQP_RK_KEY_1-4` | `1.key` .. `4.key`        |
//! | `AMQP_RK_CONFIG`  | `pingboard-configuration` |
//! | `AMQP_QU_CONFIG`  | `pingboard-configuration` |
//! | `AMQP_DECLARE`    | `false`                   |
//!
//! An empty `AMQP_RK_CONFIG` disables the configuration routing key, which
//! also disables the shutdown flush and the queue binding.

use base64::Engine;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_EXCHANGE: &str = "pingboard";
pub const DEFAULT_RK_STATUS: &str = "status";
pub const DEFAULT_RK_KEYS: [&str; KEY_COUNT] = ["1.key", "2.key", "3.key", "4.key"];
pub const DEFAULT_RK_CONFIG: &str = "pingboard-configuration";
pub const DEFAULT_QU_CONFIG: &str = "pingboard-configuration";

/// Number of keys on the device, and therefore of per-key routing keys.
pub const KEY_COUNT: usize = 4;

/// Errors raised while building an [`AmqpConfiguration`]
///
/// Every variant names the field that was rejected so startup failures are
/// actionable without a debugger.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Host configuration must be provided!")]
    MissingHost,

    #[error("User configuration must be provided!")]
    MissingUser,

    #[error("Routing key for status must be provided!")]
    MissingStatusRoutingKey,

    /// Per-key routing keys are 1-based, like the keys themselves.
    #[error("Routing key for key {0} must not be empty!")]
    EmptyKeyRoutingKey(usize),

    #[error("Exactly 4 key routing keys are required, got {0}")]
    KeyRoutingKeyCount(usize),

    #[error("Queue name for configuration must be provided!")]
    MissingQueue,

    #[error("Password in {variable} is not valid base64: {reason}")]
    InvalidPassword { variable: String, reason: String },

    #[error("Invalid value {value:?} for {variable}")]
    InvalidValue { variable: String, value: String },

    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Immutable broker connection and topology parameters
#[derive(Clone, PartialEq, Eq)]
pub struct AmqpConfiguration {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    exchange: String,
    rk_status: String,
    rk_keys: [String; KEY_COUNT],
    rk_config: Option<String>,
    qu_config: String,
    declare: bool,
}

// The password never ends up in logs.
impl fmt::Debug for AmqpConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConfiguration")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("exchange", &self.exchange)
            .field("rk_status", &self.rk_status)
            .field("rk_keys", &self.rk_keys)
            .field("rk_config", &self.rk_config)
            .field("qu_config", &self.qu_config)
            .field("declare", &self.declare)
            .finish()
    }
}

impl AmqpConfiguration {
    /// Starts a builder with every optional field at its default
    pub fn builder(host: impl Into<String>, user: impl Into<String>) -> AmqpConfigurationBuilder {
        AmqpConfigurationBuilder {
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            password: None,
            exchange: DEFAULT_EXCHANGE.to_string(),
            rk_status: DEFAULT_RK_STATUS.to_string(),
            rk_keys: DEFAULT_RK_KEYS.map(str::to_string).to_vec(),
            rk_config: Some(DEFAULT_RK_CONFIG.to_string()),
            qu_config: DEFAULT_QU_CONFIG.to_string(),
            declare: false,
        }
    }

    /// Reads the configuration from the process environment
    pub fn from_environment() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through an arbitrary variable lookup
    ///
    /// `from_environment` is this function applied to `std::env::var`; tests
    /// use it with a map to avoid touching the real environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("AMQP_HOST").unwrap_or_default();
        let user = lookup("AMQP_USER").unwrap_or_default();
        let mut builder = Self::builder(host, user);

        if let Some(port) = lookup("AMQP_PORT") {
            builder = builder.port(parse_port("AMQP_PORT", &port)?);
        }
        if let Some(encoded) = lookup("AMQP_PASS") {
            builder = builder.password(decode_password("AMQP_PASS", &encoded)?);
        }
        if let Some(exchange) = lookup("AMQP_EXCHANGE") {
            builder = builder.exchange(exchange);
        }
        if let Some(rk_status) = lookup("AMQP_RK_STATUS") {
            builder = builder.status_routing_key(rk_status);
        }

        let rk_keys = (1..=KEY_COUNT)
            .map(|idx| {
                lookup(&format!("AMQP_RK_KEY_{idx}"))
                    .unwrap_or_else(|| DEFAULT_RK_KEYS[idx - 1].to_string())
            })
            .collect();
        builder = builder.key_routing_keys(rk_keys);

        if let Some(rk_config) = lookup("AMQP_RK_CONFIG") {
            builder = builder.configuration_routing_key(Some(rk_config).filter(|rk| !rk.is_empty()));
        }
        if let Some(qu_config) = lookup("AMQP_QU_CONFIG") {
            builder = builder.configuration_queue(qu_config);
        }
        if let Some(declare) = lookup("AMQP_DECLARE") {
            builder = builder.declare(parse_flag("AMQP_DECLARE", &declare)?);
        }

        builder.build()
    }

    /// Loads the configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded {} bytes of configuration from {}", content.len(), path.display());
        Self::from_toml_str(&content)
    }

    /// Parses a TOML document into a validated configuration
    ///
    /// Unlike the environment, the file carries the password in clear text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigurationFile = toml::from_str(content)?;

        let mut builder = Self::builder(file.host.unwrap_or_default(), file.user.unwrap_or_default());
        if let Some(port) = file.port {
            builder = builder.port(port);
        }
        if let Some(password) = file.password {
            builder = builder.password(password);
        }
        if let Some(exchange) = file.exchange {
            builder = builder.exchange(exchange);
        }
        if let Some(rk_status) = file.status_routing_key {
            builder = builder.status_routing_key(rk_status);
        }
        if let Some(rk_keys) = file.key_routing_keys {
            builder = builder.key_routing_keys(rk_keys);
        }
        if let Some(rk_config) = file.configuration_routing_key {
            builder = builder.configuration_routing_key(Some(rk_config).filter(|rk| !rk.is_empty()));
        }
        if let Some(qu_config) = file.configuration_queue {
            builder = builder.configuration_queue(qu_config);
        }
        if let Some(declare) = file.declare {
            builder = builder.declare(declare);
        }

        builder.build()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn status_routing_key(&self) -> &str {
        &self.rk_status
    }

    /// Routing key for a 1-based key index, `None` outside `1..=4`
    pub fn key_routing_key(&self, index: u8) -> Option<&str> {
        let slot = usize::from(index).checked_sub(1)?;
        self.rk_keys.get(slot).map(String::as_str)
    }

    pub fn configuration_routing_key(&self) -> Option<&str> {
        self.rk_config.as_deref()
    }

    pub fn configuration_queue(&self) -> &str {
        &self.qu_config
    }

    /// Whether the topology is declared actively (`true`) or verified passively
    pub fn declare(&self) -> bool {
        self.declare
    }
}

/// Builder for [`AmqpConfiguration`]; validation happens in [`build`](Self::build)
#[derive(Debug, Clone)]
pub struct AmqpConfigurationBuilder {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    exchange: String,
    rk_status: String,
    rk_keys: Vec<String>,
    rk_config: Option<String>,
    qu_config: String,
    declare: bool,
}

impl AmqpConfigurationBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn status_routing_key(mut self, rk_status: impl Into<String>) -> Self {
        self.rk_status = rk_status.into();
        self
    }

    pub fn key_routing_keys(mut self, rk_keys: Vec<String>) -> Self {
        self.rk_keys = rk_keys;
        self
    }

    pub fn configuration_routing_key(mut self, rk_config: Option<String>) -> Self {
        self.rk_config = rk_config;
        self
    }

    pub fn configuration_queue(mut self, qu_config: impl Into<String>) -> Self {
        self.qu_config = qu_config.into();
        self
    }

    pub fn declare(mut self, declare: bool) -> Self {
        self.declare = declare;
        self
    }

    pub fn build(self) -> Result<AmqpConfiguration, ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.user.is_empty() {
            return Err(ConfigError::MissingUser);
        }
        if self.rk_status.is_empty() {
            return Err(ConfigError::MissingStatusRoutingKey);
        }
        if let Some(pos) = self.rk_keys.iter().position(String::is_empty) {
            return Err(ConfigError::EmptyKeyRoutingKey(pos + 1));
        }
        let count = self.rk_keys.len();
        let rk_keys: [String; KEY_COUNT] = self
            .rk_keys
            .try_into()
            .map_err(|_| ConfigError::KeyRoutingKeyCount(count))?;
        if self.qu_config.is_empty() {
            return Err(ConfigError::MissingQueue);
        }

        Ok(AmqpConfiguration {
            host: self.host,
            port: self.port,
            user: self.user,
            password: self.password,
            exchange: self.exchange,
            rk_status: self.rk_status,
            rk_keys,
            rk_config: self.rk_config,
            qu_config: self.qu_config,
            declare: self.declare,
        })
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct ConfigurationFile {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    exchange: Option<String>,
    status_routing_key: Option<String>,
    key_routing_keys: Option<Vec<String>>,
    configuration_routing_key: Option<String>,
    configuration_queue: Option<String>,
    declare: Option<bool>,
}

fn decode_password(variable: &str, encoded: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidPassword {
        variable: variable.to_string(),
        reason,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| invalid(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| invalid(e.to_string()))
}

fn parse_port(variable: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        variable: variable.to_string(),
        value: value.to_string(),
    })
}

fn parse_flag(variable: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            variable: variable.to_string(),
            value: value.to_string(),
        }),
    }
}
