/// Configuration management for mygate
///
/// The runtime configuration is a flat TOML file of `key = value` pairs;
/// every key is optional and falls back to its default. The backend roster
/// lives in a separate registry file, see [`registry`].
pub mod registry;

pub use registry::{NodeKey, NodeSpec, Registry, RegistryDiff, RoleLimits};

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main mygate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Detach from the terminal (left to the service manager)
    pub daemon: bool,
    /// Number of worker threads sharing the listening socket
    pub worker: usize,
    /// Maximum number of live client sessions per worker
    pub max_connections: usize,
    /// Address to listen on
    pub ip: String,
    /// Port to listen on
    pub port: u16,

    /// Seconds a session may spend reading a client command
    pub read_client_timeout: u64,
    /// Seconds a session may spend writing a command to its backend
    pub write_mysql_timeout: u64,
    /// Seconds a session may spend relaying a backend reply
    pub read_mysql_write_client_timeout: u64,
    /// Seconds a session may spend switching its backend's database
    pub prepare_mysql_timeout: u64,
    /// Seconds a session may sit idle between commands
    pub idle_timeout: u64,
    /// Seconds a keepalive ping (or a backend handshake) may take
    pub mysql_ping_timeout: u64,

    /// The single client credential accepted by the proxy
    pub user: String,
    pub passwd: String,

    /// Backend registry file
    pub mysql_conf: PathBuf,
    /// Diagnostic log file
    pub log: PathBuf,
    pub loglevel: LogLevel,
    /// Per-command audit log file
    pub sqllog: PathBuf,

    /// Node slots per role
    pub max_masters: usize,
    pub max_slaves: usize,
    /// Seconds an unregistered node keeps serving before it is torn down
    pub node_closing_delay: u64,
}

/// Diagnostic verbosity, least to most verbose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Log,
    Debug,
    Info,
}

impl LogLevel {
    /// `tracing` filter directive for this level
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::None => "off",
            LogLevel::Log => "info",
            LogLevel::Debug => "debug",
            LogLevel::Info => "trace",
        }
    }
}

/// Per-state session deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub read_client: Duration,
    pub write_mysql: Duration,
    pub read_mysql_write_client: Duration,
    pub prepare_mysql: Duration,
    pub idle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: true,
            worker: 2,
            max_connections: 100_000,
            ip: "0.0.0.0".to_string(),
            port: 13306,
            read_client_timeout: 60,
            write_mysql_timeout: 60,
            read_mysql_write_client_timeout: 300,
            prepare_mysql_timeout: 15,
            idle_timeout: 60,
            mysql_ping_timeout: 10,
            user: String::new(),
            passwd: String::new(),
            mysql_conf: PathBuf::from("./conf/mysql.conf"),
            log: PathBuf::from("./myproxy.log"),
            loglevel: LogLevel::Log,
            sqllog: PathBuf::from("./sql.log"),
            max_masters: 1,
            max_slaves: 64,
            node_closing_delay: 60,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker == 0 {
            return Err(ConfigError::ValidationError(
                "worker must be greater than 0".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        self.listen_addr()?;

        let timeouts = [
            ("read_client_timeout", self.read_client_timeout),
            ("write_mysql_timeout", self.write_mysql_timeout),
            ("read_mysql_write_client_timeout", self.read_mysql_write_client_timeout),
            ("prepare_mysql_timeout", self.prepare_mysql_timeout),
            ("idle_timeout", self.idle_timeout),
            ("mysql_ping_timeout", self.mysql_ping_timeout),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.max_masters == 0 && self.max_slaves == 0 {
            return Err(ConfigError::ValidationError(
                "at least one of max_masters and max_slaves must be greater than 0".to_string(),
            ));
        }

        if self.mysql_conf.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "mysql_conf cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Socket address built from `ip` and `port`
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|_| ConfigError::ValidationError(format!("Invalid listen address: {}", self.ip)))
    }

    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            read_client: Duration::from_secs(self.read_client_timeout),
            write_mysql: Duration::from_secs(self.write_mysql_timeout),
            read_mysql_write_client: Duration::from_secs(self.read_mysql_write_client_timeout),
            prepare_mysql: Duration::from_secs(self.prepare_mysql_timeout),
            idle: Duration::from_secs(self.idle_timeout),
        }
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.mysql_ping_timeout)
    }

    pub fn closing_delay(&self) -> Duration {
        Duration::from_secs(self.node_closing_delay)
    }

    pub fn role_limits(&self) -> RoleLimits {
        RoleLimits {
            masters: self.max_masters,
            slaves: self.max_slaves,
        }
    }

    /// Load the backend registry named by `mysql_conf`
    pub fn load_registry(&self) -> Result<Registry, ConfigError> {
        Registry::load_from_file(&self.mysql_conf, self.role_limits())
    }

    /// Write an annotated example configuration
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            daemon: false,
            user: "proxy".to_string(),
            passwd: "proxy".to_string(),
            ..Default::default()
        };
        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 13306);
        assert_eq!(config.worker, 2);
        assert_eq!(config.loglevel, LogLevel::Log);
        assert_eq!(config.session_timeouts().read_mysql_write_client, Duration::from_secs(300));
        assert_eq!(config.session_timeouts().prepare_mysql, Duration::from_secs(15));
        assert_eq!(config.ping_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.max_connections = 0;
        assert!(config.validate().is_err());
        config.max_connections = 1000;
        assert!(config.validate().is_ok());

        config.idle_timeout = 0;
        assert!(config.validate().is_err());
        config.idle_timeout = 60;

        config.ip = "not-an-ip".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            "worker = 4\nport = 3307\nuser = \"app\"\npasswd = \"secret\"\nloglevel = \"debug\"\nidle_timeout = 30"
        )
        .unwrap();

        let config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.worker, 4);
        assert_eq!(config.port, 3307);
        assert_eq!(config.user, "app");
        assert_eq!(config.loglevel, LogLevel::Debug);
        assert_eq!(config.session_timeouts().idle, Duration::from_secs(30));
        assert_eq!(config.read_client_timeout, 60);
        assert_eq!(config.mysql_conf, PathBuf::from("./conf/mysql.conf"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "wokrer = 4").unwrap();
        let err = Config::load_from_file(temp_file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_bad_loglevel_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "loglevel = \"verbose\"").unwrap();
        assert!(Config::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_log_level_directives() {
        assert_eq!(LogLevel::None.directive(), "off");
        assert_eq!(LogLevel::Log.directive(), "info");
        assert_eq!(LogLevel::Debug.directive(), "debug");
        assert_eq!(LogLevel::Info.directive(), "trace");
    }

    #[test]
    fn test_config_file_operations() {
        let temp_file = NamedTempFile::new().unwrap();
        Config::create_example_config(temp_file.path()).unwrap();
        let loaded = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.user, "proxy");
        assert!(!loaded.daemon);
        assert_eq!(loaded.listen_addr().unwrap().port(), 13306);
    }
}
