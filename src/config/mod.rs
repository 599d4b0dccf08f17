//! Configuration types and loading.
//!
//! Each binary starts from its own service defaults and layers files and
//! environment variables on top with the `config` crate.

mod broker;

pub use broker::{BrokerConfig, DEFAULT_BROKER_URL};

use serde::{Deserialize, Serialize};

use crate::event::{
    AccountCreated, AccountCreatedAck, DomainEvent, ACCOUNTS_QUEUE, AUTH_SERVICE_QUEUE,
};

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TWITCHY_CONFIG";
/// Environment variable prefix for configuration overrides.
pub const CONFIG_ENV_PREFIX: &str = "TWITCHY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TWITCHY_LOG";

/// Legacy broker credentials, shared with the other services' deployments.
pub const RABBITMQ_USER_ENV_VAR: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV_VAR: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_HOST_ENV_VAR: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV_VAR: &str = "RABBITMQ_PORT";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub accounts: AccountsConfig,
}

/// Settings for the accounts service handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Publish `account_created_ack` after storing an account.
    pub emit_acks: bool,
    /// Service name stamped on acks.
    pub service_name: String,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            emit_acks: true,
            service_name: "accounts".to_string(),
        }
    }
}

impl Config {
    /// Defaults for the accounts service: consumes `account.created`.
    pub fn accounts_service() -> Self {
        Self {
            broker: BrokerConfig {
                queue: Some(ACCOUNTS_QUEUE.to_string()),
                bindings: vec![AccountCreated::ROUTING_KEY.to_string()],
                consumer_prefix: "accounts".to_string(),
                ..BrokerConfig::default()
            },
            accounts: AccountsConfig::default(),
        }
    }

    /// Defaults for the auth service: publishes `account.created`, consumes acks.
    pub fn auth_service() -> Self {
        Self {
            broker: BrokerConfig {
                queue: Some(AUTH_SERVICE_QUEUE.to_string()),
                bindings: vec![AccountCreatedAck::ROUTING_KEY.to_string()],
                consumer_prefix: "auth".to_string(),
                ..BrokerConfig::default()
            },
            accounts: AccountsConfig::default(),
        }
    }

    /// Load configuration on top of `defaults`.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `defaults`
    /// 2. `config.yaml` in current directory (if exists)
    /// 3. File specified by `path` argument (if provided)
    /// 4. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 5. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 6. Legacy `RABBITMQ_*` variables, which replace `broker.url`
    pub fn load(path: Option<&str>, defaults: Config) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(ConfigLib::try_from(&defaults)?)
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("broker.bindings")
                    .try_parsing(true),
            )
            .set_override_option("broker.url", legacy_broker_url())?
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.broker.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }
}

/// Assemble a broker URL from the legacy `RABBITMQ_*` variables.
///
/// Only applies when `RABBITMQ_HOST` is set; user, password and port fall
/// back to the broker's stock defaults.
pub fn legacy_broker_url() -> Option<String> {
    let host = std::env::var(RABBITMQ_HOST_ENV_VAR).ok()?;
    let user = std::env::var(RABBITMQ_USER_ENV_VAR).unwrap_or_else(|_| "guest".to_string());
    let password =
        std::env::var(RABBITMQ_PASSWORD_ENV_VAR).unwrap_or_else(|_| "guest".to_string());
    let port = std::env::var(RABBITMQ_PORT_ENV_VAR).unwrap_or_else(|_| "5672".to_string());
    Some(format!("amqp://{user}:{password}@{host}:{port}/"))
}
