//! Historian configuration.
//!
//! [`HistorianOptions`] is what callers supply (YAML, environment or code).
//! [`HistorianOptions::resolve`] turns it into a frozen [`ConnectionSettings`]
//! exactly once, before the first connection. Connection parameters come
//! from the first source present:
//! 1. `encrypted_config`: inline encrypted token
//! 2. `config_file`: path to an encrypted token file
//! 3. the plaintext `user`/`password`/`database`/`host`/`port` fields

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use tracing::warn;

use crate::error::{HistoryError, Result};
use crate::storage::pool::PoolSettings;
use crate::storage::reader::MAX_PAGE_SIZE;
use crate::vault::{self, ConnectionConfig, EncryptedConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "pghistorian.yaml";

/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PGHISTORIAN_CONFIG";

/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PGHISTORIAN";

/// Prefix for administrative configuration environment variables.
pub const ADMIN_ENV_PREFIX: &str = "PGHISTORIAN_ADMIN";

/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PGHISTORIAN_LOG";

/// Default PostgreSQL port.
pub const DEFAULT_PORT: u16 = 5432;

/// Default file name for the encrypted connection config.
pub const DEFAULT_ENCRYPTED_CONFIG_FILE: &str = "pghistorian.enc";

/// Construction options of the history engine.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct HistorianOptions {
    pub user: String,
    pub password: String,
    pub database: String,
    pub host: String,
    pub port: u16,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    /// Silent retries after a dropped connection.
    pub connect_retries: usize,
    /// Upper bound on rows per page.
    pub max_history_response_size: usize,
    /// Encrypted config file (needs `master_password`).
    pub config_file: Option<PathBuf>,
    /// Inline encrypted config token (needs `master_password`).
    pub encrypted_config: Option<String>,
    pub master_password: Option<String>,
    /// Convert history tables to TimescaleDB hypertables.
    pub timescaledb: bool,
    /// Apply retention after every write.
    pub enforce_retention_on_write: bool,
    /// Run a background retention sweep this often.
    pub retention_interval_secs: Option<u64>,
}

impl Default for HistorianOptions {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: "postmaster".to_string(),
            database: "opcua".to_string(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            min_pool_size: 5,
            max_pool_size: 20,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            connect_retries: 3,
            max_history_response_size: 10_000,
            config_file: None,
            encrypted_config: None,
            master_password: None,
            timescaledb: false,
            enforce_retention_on_write: true,
            retention_interval_secs: None,
        }
    }
}

impl fmt::Debug for HistorianOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistorianOptions")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("min_pool_size", &self.min_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("max_history_response_size", &self.max_history_response_size)
            .field("config_file", &self.config_file)
            .field("encrypted_config", &self.encrypted_config.as_ref().map(|_| "<token>"))
            .field("master_password", &self.master_password.as_ref().map(|_| "<redacted>"))
            .field("timescaledb", &self.timescaledb)
            .finish_non_exhaustive()
    }
}

impl HistorianOptions {
    /// Load options from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `pghistorian.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self> {
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
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            min_size: self.min_pool_size,
            max_size: self.max_pool_size,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            connect_retries: self.connect_retries,
        }
    }

    /// Resolve connection parameters by precedence and freeze everything.
    pub fn resolve(&self) -> Result<ConnectionSettings> {
        let (connection, source) = if let Some(token) = &self.encrypted_config {
            let sealed = EncryptedConfig::from_token(token)?;
            let config = vault::decrypt(&sealed, self.require_master_password()?)?;
            (config, ConfigSource::InlineEncrypted)
        } else if let Some(path) = &self.config_file {
            let sealed = EncryptedConfig::load(path)?;
            let config = vault::decrypt(&sealed, self.require_master_password()?)?;
            (config, ConfigSource::EncryptedFile(path.clone()))
        } else {
            let config = ConnectionConfig {
                user: self.user.clone(),
                password: self.password.clone(),
                database: self.database.clone(),
                host: self.host.clone(),
                port: self.port,
                created_at: Utc::now(),
            };
            (config, ConfigSource::Direct)
        };

        validate_connection(&connection)?;
        let pool = self.pool_settings();
        pool.validate()?;
        if self.max_history_response_size == 0 {
            return Err(HistoryError::Validation(
                "max_history_response_size must be positive".into(),
            ));
        }
        let max_history_response_size = if self.max_history_response_size > MAX_PAGE_SIZE {
            warn!(
                requested = self.max_history_response_size,
                max = MAX_PAGE_SIZE,
                "max_history_response_size clamped"
            );
            MAX_PAGE_SIZE
        } else {
            self.max_history_response_size
        };

        Ok(ConnectionSettings {
            connection,
            source,
            pool,
            max_history_response_size,
            timescaledb: self.timescaledb,
            enforce_retention_on_write: self.enforce_retention_on_write,
            retention_interval: self
                .retention_interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        })
    }

    fn require_master_password(&self) -> Result<&str> {
        match self.master_password.as_deref() {
            Some(pw) if !pw.is_empty() => Ok(pw),
            _ => Err(HistoryError::Validation(
                "master_password is required for an encrypted config".into(),
            )),
        }
    }
}

fn validate_connection(config: &ConnectionConfig) -> Result<()> {
    for (name, value) in [
        ("user", &config.user),
        ("database", &config.database),
        ("host", &config.host),
    ] {
        if value.trim().is_empty() {
            return Err(HistoryError::Validation(format!("{name} must not be empty")));
        }
    }
    if config.port == 0 {
        return Err(HistoryError::Validation("port must not be 0".into()));
    }
    Ok(())
}

/// Where the connection parameters came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    InlineEncrypted,
    EncryptedFile(PathBuf),
    Direct,
}

/// Frozen, validated settings the engine runs with.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connection: ConnectionConfig,
    pub source: ConfigSource,
    pub pool: PoolSettings,
    pub max_history_response_size: usize,
    pub timescaledb: bool,
    pub enforce_retention_on_write: bool,
    pub retention_interval: Option<Duration>,
}

impl ConnectionSettings {
    pub fn connect_options(&self) -> PgConnectOptions {
        connect_options(&self.connection)
    }
}

/// sqlx connect options for a connection config.
pub fn connect_options(config: &ConnectionConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.database)
        .application_name("pghistorian")
}

/// Settings of the administrative manager.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub host: String,
    pub port: u16,
    /// Role allowed to create roles and databases.
    pub superuser: String,
    pub superuser_password: String,
    /// Database the superuser connects to for bootstrap.
    pub maintenance_database: String,
    /// Historian database and its owner role.
    pub database: String,
    pub user: String,
    pub password: String,
    pub master_password: Option<String>,
    /// Where the encrypted connection config is written.
    pub config_file: PathBuf,
    pub timescaledb: bool,
    pub pg_dump: String,
    pub pg_restore: String,
    pub psql: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            superuser: "postgres".to_string(),
            superuser_password: String::new(),
            maintenance_database: "postgres".to_string(),
            database: "opcua".to_string(),
            user: "opcua_historian".to_string(),
            password: String::new(),
            master_password: None,
            config_file: PathBuf::from(DEFAULT_ENCRYPTED_CONFIG_FILE),
            timescaledb: false,
            pg_dump: "pg_dump".to_string(),
            pg_restore: "pg_restore".to_string(),
            psql: "psql".to_string(),
        }
    }
}

impl fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("superuser", &self.superuser)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("config_file", &self.config_file)
            .field("timescaledb", &self.timescaledb)
            .finish_non_exhaustive()
    }
}

impl AdminConfig {
    /// Load from an optional YAML file and `PGHISTORIAN_ADMIN__*` variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder();
        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ADMIN_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Connection config of the historian role.
    pub fn historian_connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            host: self.host.clone(),
            port: self.port,
            created_at: Utc::now(),
        }
    }

    /// Connection config of the superuser on the maintenance database.
    pub fn superuser_connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            user: self.superuser.clone(),
            password: self.superuser_password.clone(),
            database: self.maintenance_database.clone(),
            host: self.host.clone(),
            port: self.port,
            created_at: Utc::now(),
        }
    }
}
