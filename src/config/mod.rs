//! Client configuration.
//!
//! Loaded from YAML files and environment variables into a single
//! `ClientConfig`, then turned into [`ClientSettings`] for
//! [`Client::connect`](crate::client::Client::connect).

use serde::Deserialize;

use crate::client::{ClientSettings, Credentials, Transport};
use crate::error::ClientError;
use crate::reader::MAX_BATCH_SIZE;
use crate::runtime::DEFAULT_WORKER_THREADS;
use crate::subscription::{SubscriptionSettings, DEFAULT_SUBSCRIBER_BUFFER};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "esclient";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ESCLIENT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ESCLIENT";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ESCLIENT_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

/// Where the store lives and how to authenticate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
    /// Retries after the first failed connection attempt.
    pub connect_retries: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let credentials = Credentials::default();
        Self {
            transport: Transport::Memory,
            host: "127.0.0.1".to_string(),
            port: 1113,
            username: credentials.username,
            password: credentials.password,
            tls: false,
            connect_retries: 30,
        }
    }
}

/// Client-side runtime tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub worker_threads: usize,
    pub read_batch_size: usize,
    pub subscription_buffer_size: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            read_batch_size: MAX_BATCH_SIZE,
            subscription_buffer_size: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub client: ClientSection,
    /// Defaults for subscription groups created from configuration.
    pub subscription: SubscriptionSettings,
}

impl ClientConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `esclient.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` between
    ///    sections (`ESCLIENT_CONNECTION__HOST`)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
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
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ClientConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no client can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.host.is_empty() {
            return Err(ConfigError::Invalid("connection.host is empty".to_string()));
        }
        if self.client.worker_threads == 0 {
            return Err(ConfigError::Invalid(
                "client.worker_threads must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.client.read_batch_size) {
            return Err(ConfigError::Invalid(format!(
                "client.read_batch_size must be within 1..={}",
                MAX_BATCH_SIZE
            )));
        }
        if self.client.subscription_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "client.subscription_buffer_size must be at least 1".to_string(),
            ));
        }
        self.subscription
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("subscription: {}", e)))
    }

    /// Settings for [`Client::connect`](crate::client::Client::connect).
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            transport: self.connection.transport,
            host: self.connection.host.clone(),
            port: self.connection.port,
            credentials: Credentials::new(
                self.connection.username.clone(),
                self.connection.password.clone(),
            ),
            tls: self.connection.tls,
            connect_retries: self.connection.connect_retries,
            worker_threads: self.client.worker_threads,
            read_batch_size: self.client.read_batch_size,
            subscription_buffer_size: self.client.subscription_buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    use crate::subscription::StartFrom;

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn clear_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with("ESCLIENT_") {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_defaults_match_client_settings() {
        let config = ClientConfig::default();
        assert_eq!(config.client_settings(), ClientSettings::default());
    }

    #[test]
    #[serial]
    fn test_load_without_sources_uses_defaults() {
        clear_env();
        let config = ClientConfig::load(None).unwrap();
        assert_eq!(config.connection.host, "127.0.0.1");
        assert_eq!(config.connection.port, 1113);
        assert_eq!(config.client.worker_threads, 2);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        clear_env();
        let file = write_yaml(
            r#"
connection:
  transport: eventstoredb
  host: db.internal
  port: 2113
  username: ops
  password: hunter2
  tls: true
client:
  worker_threads: 4
subscription:
  history_buffer_size: 20
  max_retry_count: 500
  checkpoint_after_ms: 2000
  start_from: beginning
"#,
        );
        let config = ClientConfig::load(file.path().to_str()).unwrap();

        let settings = config.client_settings();
        assert_eq!(settings.transport, Transport::EventStoreDb);
        assert_eq!(settings.address(), "db.internal:2113");
        assert_eq!(settings.credentials, Credentials::new("ops", "hunter2"));
        assert!(settings.tls);
        assert_eq!(settings.worker_threads, 4);

        assert_eq!(config.subscription.history_buffer_size, 20);
        assert_eq!(config.subscription.max_retry_count, 500);
        assert_eq!(config.subscription.checkpoint_after, Duration::from_secs(2));
        assert_eq!(config.subscription.start_from, StartFrom::Beginning);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let file = write_yaml("connection:\n  host: from-file\n  port: 2113\n");
        std::env::set_var("ESCLIENT_CONFIG", file.path());
        std::env::set_var("ESCLIENT_CONNECTION__HOST", "from-env");
        std::env::set_var("ESCLIENT_CLIENT__WORKER_THREADS", "3");

        let config = ClientConfig::load(None);
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.connection.host, "from-env");
        assert_eq!(config.connection.port, 2113);
        assert_eq!(config.client.worker_threads, 3);
    }

    #[test]
    #[serial]
    fn test_start_revision_map_form() {
        clear_env();
        let file = write_yaml("subscription:\n  start_from:\n    revision: 7\n");
        let config = ClientConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.subscription.start_from, StartFrom::Revision(7));
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_fails() {
        clear_env();
        let err = ClientConfig::load(Some("/nonexistent/esclient.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        clear_env();
        let file = write_yaml("client:\n  worker_threads: 0\n");
        let err = ClientConfig::load(file.path().to_str()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let file = write_yaml("subscription:\n  min_checkpoint_count: 50\n  max_checkpoint_count: 5\n");
        let err = ClientConfig::load(file.path().to_str()).unwrap_err();
        assert!(err.to_string().contains("subscription"));
    }

    #[test]
    fn test_config_error_converts_to_client_error() {
        let err: ClientError = ConfigError::Invalid("bad".to_string()).into();
        assert!(matches!(err, ClientError::Config(_)));
    }
}
