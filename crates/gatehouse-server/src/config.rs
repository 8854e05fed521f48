//! Layered configuration: built-in defaults, then the INI file, then
//! `GATEHOUSE__SECTION__KEY` environment variables.
//!
//! ```ini
//! [Server]
//! Port=8080
//!
//! [Database.Account]
//! Driver=mysql
//! Host=127.0.0.1
//! MinPoolSize=1
//! ```
//!
//! A value that does not parse keeps its default and logs a warning.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat, Value, ValueKind};
use tracing::warn;

use gatehouse_api::AccountPolicy;
use gatehouse_db::{DriverKind, PoolConfig};

const ENV_PREFIX: &str = "GATEHOUSE";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub server_name: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            max_connections: 1000,
            server_name: "AccountSvr".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, e.g. `info` or `gatehouse_db=debug,info`.
    pub level: String,
    pub console: bool,
    pub file: bool,
    pub file_path: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            console: true,
            file: false,
            file_path: PathBuf::from("logs/accountsvr.log"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerformanceSettings {
    /// io_uring worker threads.
    pub thread_pool_size: usize,
    pub queue_capacity: usize,
    pub receive_buffer_size: usize,
    pub max_client_buffer: usize,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            thread_pool_size: 4,
            queue_capacity: 10_000,
            receive_buffer_size: 8192,
            max_client_buffer: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub account_db: PoolConfig,
    pub game_db: PoolConfig,
    pub logging: LoggingSettings,
    pub security: AccountPolicy,
    pub performance: PerformanceSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            account_db: PoolConfig::default(),
            game_db: PoolConfig {
                database: "game".into(),
                ..PoolConfig::default()
            },
            logging: LoggingSettings::default(),
            security: AccountPolicy::default(),
            performance: PerformanceSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load from `path` and the environment. A missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::new(&path.to_string_lossy(), FileFormat::Ini).required(false);
        Self::from_layers(file, environment())
            .with_context(|| format!("loading configuration from {}", path.display()))
    }

    /// Environment values win over file values.
    fn from_layers<F>(file: F, env: Environment) -> Result<Self>
    where
        F: config::Source + Send + Sync + 'static,
    {
        let env_layer = tree(Config::builder().add_source(env))?;
        let file_layer = tree(Config::builder().add_source(file))?;
        Ok(Self::from_settings(&Settings {
            layers: vec![env_layer, file_layer],
        }))
    }

    fn from_settings(s: &Settings) -> Self {
        let defaults = Self::default();
        Self {
            server: ServerSettings {
                host: s.string("Server", "Host", &defaults.server.host),
                port: s.parse("Server", "Port", defaults.server.port),
                max_connections: s.parse("Server", "MaxConnections", defaults.server.max_connections),
                server_name: s.string("Server", "ServerName", &defaults.server.server_name),
            },
            account_db: pool_config(s, "Database.Account", &defaults.account_db),
            game_db: pool_config(s, "Database.Game", &defaults.game_db),
            logging: LoggingSettings {
                level: s.string("Logging", "Level", &defaults.logging.level).to_ascii_lowercase(),
                console: s.flag("Logging", "Console", defaults.logging.console),
                file: s.flag("Logging", "File", defaults.logging.file),
                file_path: PathBuf::from(s.string(
                    "Logging",
                    "FilePath",
                    &defaults.logging.file_path.to_string_lossy(),
                )),
            },
            security: AccountPolicy {
                password_min_length: s.parse(
                    "Security",
                    "PasswordMinLength",
                    defaults.security.password_min_length,
                ),
                username_max_length: s.parse(
                    "Security",
                    "UsernameMaxLength",
                    defaults.security.username_max_length,
                ),
            },
            performance: PerformanceSettings {
                thread_pool_size: s.parse("Performance", "ThreadPoolSize", defaults.performance.thread_pool_size),
                queue_capacity: s.parse("Performance", "QueueCapacity", defaults.performance.queue_capacity),
                receive_buffer_size: s.parse(
                    "Performance",
                    "ReceiveBufferSize",
                    defaults.performance.receive_buffer_size,
                ),
                max_client_buffer: s.parse(
                    "Performance",
                    "MaxClientBuffer",
                    defaults.performance.max_client_buffer,
                ),
            },
        }
    }
}

fn tree(builder: ConfigBuilder<DefaultState>) -> Result<HashMap<String, Value>> {
    Ok(builder.build()?.try_deserialize()?)
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR)
}

fn pool_config(s: &Settings, section: &str, defaults: &PoolConfig) -> PoolConfig {
    let driver = match s.raw(section, "Driver") {
        Some(name) => DriverKind::parse(&name).unwrap_or_else(|| {
            warn!(section, driver = %name, "Unknown database driver, using default");
            defaults.driver
        }),
        None => defaults.driver,
    };
    let seconds = |key: &str, default: Duration| Duration::from_secs(s.parse(section, key, default.as_secs()));

    PoolConfig {
        driver,
        host: s.string(section, "Host", &defaults.host),
        port: s.parse(section, "Port", defaults.port),
        database: s.string(section, "Database", &defaults.database),
        username: s.string(section, "Username", &defaults.username),
        password: s.string(section, "Password", &defaults.password),
        connection_timeout: seconds("ConnectionTimeout", defaults.connection_timeout),
        query_timeout: seconds("QueryTimeout", defaults.query_timeout),
        min_pool_size: s.parse(section, "MinPoolSize", defaults.min_pool_size),
        max_pool_size: s.parse(section, "MaxPoolSize", defaults.max_pool_size),
        idle_timeout: seconds("IdleTimeout", defaults.idle_timeout),
        cleanup_interval: defaults.cleanup_interval,
        health_check_interval: defaults.health_check_interval,
    }
}

/// Case-insensitive lookups over configuration layers, highest priority
/// first. A dotted section such as `Database.Account` may arrive nested or
/// as one key, so lookups accept both shapes.
struct Settings {
    layers: Vec<HashMap<String, Value>>,
}

impl Settings {
    fn raw(&self, section: &str, key: &str) -> Option<String> {
        let mut path: Vec<&str> = section.split('.').collect();
        path.push(key);
        self.layers.iter().find_map(|layer| {
            let value = find(layer, &path)?;
            match &value.kind {
                ValueKind::Table(_) | ValueKind::Array(_) | ValueKind::Nil => None,
                _ => value.clone().into_string().ok().map(|v| v.trim().to_string()),
            }
        })
    }

    fn string(&self, section: &str, key: &str, default: &str) -> String {
        self.raw(section, key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, section: &str, key: &str, default: T) -> T
    where
        T: FromStr + Display + Copy,
    {
        let Some(raw) = self.raw(section, key) else {
            return default;
        };
        raw.parse().unwrap_or_else(|_| {
            warn!(section, key, value = %raw, %default, "Invalid configuration value, using default");
            default
        })
    }

    fn flag(&self, section: &str, key: &str, default: bool) -> bool {
        let Some(raw) = self.raw(section, key) else {
            return default;
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!(section, key, value = %raw, default, "Invalid boolean, using default");
                default
            }
        }
    }
}

/// Walk `path` through nested tables. Any run of segments may also match
/// one dotted key at a level.
fn find<'a, M>(table: M, path: &[&str]) -> Option<&'a Value>
where
    M: IntoIterator<Item = (&'a String, &'a Value)> + Copy,
{
    for split in 1..=path.len() {
        let key = path[..split].join(".");
        let Some((_, value)) = table.into_iter().find(|(k, _)| k.eq_ignore_ascii_case(&key)) else {
            continue;
        };
        if split == path.len() {
            return Some(value);
        }
        if let ValueKind::Table(inner) = &value.kind {
            if let Some(found) = find(inner, &path[split..]) {
                return Some(found);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
[Server]
Port=9100
Host=127.0.0.1
ServerName=TestSvr

[Database.Account]
Driver=sqlite
Database=/tmp/account.db
MinPoolSize=2
MaxPoolSize=5
ConnectionTimeout=3

[Database.Game]
Host=10.0.0.2
MaxPoolSize=lots

[Logging]
Level=DEBUG
Console=false
File=true

[Performance]
QueueCapacity=16
";

    fn load(ini: &str, env: &[(&str, &str)]) -> AppConfig {
        let vars: config::Map<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_layers(File::from_str(ini, FileFormat::Ini), environment().source(Some(vars))).unwrap()
    }

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::load(Path::new("/nonexistent/gatehouse.ini")).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.server_name, "AccountSvr");
        assert_eq!(config.logging, defaults.logging);
        assert_eq!(config.game_db.database, "game");
        assert_eq!(config.account_db.max_pool_size, 10);
        assert_eq!(config.performance.max_client_buffer, 65_536);
    }

    #[test]
    fn test_ini_values() {
        let config = load(SAMPLE, &[]);
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.server_name, "TestSvr");

        assert_eq!(config.account_db.driver, DriverKind::Sqlite);
        assert_eq!(config.account_db.database, "/tmp/account.db");
        assert_eq!(config.account_db.min_pool_size, 2);
        assert_eq!(config.account_db.max_pool_size, 5);
        assert_eq!(config.account_db.connection_timeout, Duration::from_secs(3));

        assert_eq!(config.game_db.host, "10.0.0.2");
        assert_eq!(config.game_db.database, "game");

        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.console);
        assert!(config.logging.file);
        assert_eq!(config.performance.queue_capacity, 16);
    }

    #[test]
    fn test_invalid_value_keeps_default() {
        let config = load(SAMPLE, &[]);
        assert_eq!(config.game_db.max_pool_size, 10);
    }

    #[test]
    fn test_environment_overrides_file() {
        let config = load(
            SAMPLE,
            &[
                ("GATEHOUSE__SERVER__PORT", "9200"),
                ("GATEHOUSE__DATABASE__GAME__MAXPOOLSIZE", "3"),
                ("GATEHOUSE__SECURITY__PASSWORDMINLENGTH", "8"),
            ],
        );
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.game_db.max_pool_size, 3);
        assert_eq!(config.game_db.host, "10.0.0.2");
        assert_eq!(config.security.password_min_length, 8);
    }
}
