//! Server configuration.
//!
//! [`ServerConfig`] is the single source of truth for every runtime setting.
//! It can be built in code ([`ServerConfig::new`], or `Default` plus field
//! edits) or loaded from a TOML file:
//!
//! ```toml
//! max_connections = 10
//! port = 3013
//! bind_address = "0.0.0.0"
//! watchdog_period_ms = 30000
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "...")]`, so a file only needs the
//! settings it changes.  A config is validated once, when the server is
//! created; it is never re-read afterwards.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ws_core::protocol::frame::MAX_CONTROL_PAYLOAD;

/// Error type for building or loading a [`ServerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is outside its allowed range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema ─────────────────────────────────────────────────────────────

/// All runtime configuration for one server instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Maximum simultaneous connections, counted from TCP accept.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// TCP port to listen on.  Must be non-zero.
    #[serde(default = "default_port")]
    pub port: u16,
    /// IP address to bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Watchdog tick period in milliseconds.  `0` disables the watchdog.
    #[serde(default = "default_watchdog_period_ms")]
    pub watchdog_period_ms: u64,
    /// Time allowed for the client to send a complete upgrade request.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Upper bound on any single transport write, and on the wait for the
    /// peer's reply to a close frame the server sent first.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Largest frame payload or reassembled message accepted from a client.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Frames queued per connection before it is treated as a slow consumer.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_max_connections() -> u32 {
    10
}
fn default_port() -> u16 {
    3013
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_watchdog_period_ms() -> u64 {
    30_000
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_write_timeout_ms() -> u64 {
    5_000
}
fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}
fn default_outbound_queue_capacity() -> usize {
    64
}

impl Default for ServerConfig {
    /// | Field                   | Default   |
    /// |-------------------------|-----------|
    /// | max_connections         | 10        |
    /// | port                    | 3013      |
    /// | bind_address            | `0.0.0.0` |
    /// | watchdog_period_ms      | 30 000    |
    /// | handshake_timeout_ms    | 5 000     |
    /// | write_timeout_ms        | 5 000     |
    /// | max_message_size        | 16 MiB    |
    /// | outbound_queue_capacity | 64        |
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            port: default_port(),
            bind_address: default_bind_address(),
            watchdog_period_ms: default_watchdog_period_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl ServerConfig {
    /// Creates a validated config with every other field at its default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `max_connections` or `port` is 0.
    pub fn new(max_connections: u32, port: u16) -> Result<Self, ConfigError> {
        let config = Self {
            max_connections,
            port,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks every field against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be greater than 0"));
        }
        if self.port == 0 {
            return Err(invalid("port", "must be in 1..=65535"));
        }
        self.bind_ip()?;
        if self.handshake_timeout_ms == 0 {
            return Err(invalid("handshake_timeout_ms", "must be greater than 0"));
        }
        if self.write_timeout_ms == 0 {
            return Err(invalid("write_timeout_ms", "must be greater than 0"));
        }
        if self.max_message_size < MAX_CONTROL_PAYLOAD {
            return Err(invalid(
                "max_message_size",
                format!("must be at least {MAX_CONTROL_PAYLOAD}"),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(invalid("outbound_queue_capacity", "must be greater than 0"));
        }
        Ok(())
    }

    /// Socket address the listener binds to.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.port))
    }

    /// Watchdog period, or `None` when the watchdog is disabled.
    pub fn watchdog_period(&self) -> Option<Duration> {
        (self.watchdog_period_ms > 0).then(|| Duration::from_millis(self.watchdog_period_ms))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.bind_address.parse().map_err(|_| {
            invalid(
                "bind_address",
                format!("{:?} is not an IP address", self.bind_address),
            )
        })
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_connections, 10);
        assert_eq!(cfg.port, 3013);
        assert_eq!(cfg.watchdog_period(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.max_message_size, 16 * 1024 * 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_new_rejects_zero_max_connections() {
        let err = ServerConfig::new(0, 3013).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "max_connections",
                ..
            }
        ));
    }

    #[test]
    fn test_new_rejects_port_zero() {
        let err = ServerConfig::new(10, 0).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "port", .. }));
    }

    #[test]
    fn test_zero_watchdog_period_disables_watchdog() {
        let cfg = ServerConfig {
            watchdog_period_ms: 0,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.watchdog_period(), None);
    }

    #[test]
    fn test_invalid_bind_address_is_rejected() {
        let cfg = ServerConfig {
            bind_address: "not.an.ip".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "bind_address",
                ..
            })
        ));
    }

    #[test]
    fn test_socket_addr_combines_bind_address_and_port() {
        let cfg = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 9000,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.socket_addr().unwrap().to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn test_partial_toml_uses_defaults_for_missing_fields() {
        // Arrange
        let text = "port = 4000\nwatchdog_period_ms = 500\n";

        // Act
        let cfg = ServerConfig::from_toml_str(text).unwrap();

        // Assert
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.watchdog_period_ms, 500);
        assert_eq!(cfg.max_connections, 10);
        assert_eq!(cfg.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_toml_with_invalid_value_fails_validation() {
        let err = ServerConfig::from_toml_str("max_connections = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let err = ServerConfig::from_toml_str("port = \"not a number\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_serialized_config_parses_back() {
        let original = ServerConfig::new(3, 8080).unwrap();
        let text = toml::to_string(&original).unwrap();
        assert_eq!(ServerConfig::from_toml_str(&text).unwrap(), original);
    }

    #[test]
    fn test_load_reads_file_from_disk() {
        let path = std::env::temp_dir().join(format!(
            "ws-server-config-{}.toml",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "max_connections = 2").unwrap();
        drop(file);

        let cfg = ServerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.max_connections, 2);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = ServerConfig::load(Path::new("/nonexistent/ws-server.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
