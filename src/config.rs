//! Scope configuration using Figment
//!
//! Configuration is an explicit struct handed to constructors; nothing reads
//! a global. It is assembled from (lowest to highest precedence):
//! 1. Built-in defaults
//! 2. A TOML file (default: `config/scope.toml`, optional)
//! 3. Environment variables prefixed with `RUSTSCOPE_`, nested keys split on `__`
//!
//! ```text
//! RUSTSCOPE_APPLICATION__LOG_LEVEL=debug
//! RUSTSCOPE_SERVER__RPC_PORT=7000
//! ```
//!
//! # Example file
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! rpc_port = 6000
//! heartbeat_interval_ms = 1000
//!
//! [[devices]]
//! name = "stand"
//! transport = "serial"
//! port = "/dev/ttyScope"
//! baud_rate = 115200
//! terminator = "\r"
//! correlator = "function_unit"
//! event_keys = ["$71001"]
//! ```

use crate::error::{AppResult, ScopeError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/scope.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RUSTSCOPE_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScopeConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Network endpoints for the RPC, interrupt and property channels
    #[serde(default)]
    pub server: ServerConfig,
    /// Message manager tuning
    #[serde(default)]
    pub messaging: MessagingConfig,
    /// Devices sharing message managers
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Application name, also the root of published property names
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON formatted logs
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "scope".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Addresses of the network channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Interface to bind (server) or connect to (client)
    pub host: String,
    /// Request/reply channel
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// One-way interrupt channel
    #[serde(default = "default_interrupt_port")]
    pub interrupt_port: u16,
    /// Property broadcast channel
    #[serde(default = "default_property_port")]
    pub property_port: u16,
    /// Liveness beats
    #[serde(default = "default_heartbeat_port")]
    pub heartbeat_port: u16,
    /// Time between beats
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            rpc_port: default_rpc_port(),
            interrupt_port: default_interrupt_port(),
            property_port: default_property_port(),
            heartbeat_port: default_heartbeat_port(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl ServerConfig {
    /// `host:rpc_port`
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }

    /// `host:interrupt_port`
    pub fn interrupt_addr(&self) -> String {
        format!("{}:{}", self.host, self.interrupt_port)
    }

    /// `host:property_port`
    pub fn property_addr(&self) -> String {
        format!("{}:{}", self.host, self.property_port)
    }

    /// `host:heartbeat_port`
    pub fn heartbeat_addr(&self) -> String {
        format!("{}:{}", self.host, self.heartbeat_port)
    }

    /// Beat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Message manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagingConfig {
    /// Read timeout of the underlying port. Bounds how long a stop request
    /// waits for the receive loop to notice it.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl MessagingConfig {
    /// Read timeout as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// How a device reaches its hardware.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// RS-232 port opened with the serialport crate
    Serial,
    /// Raw TCP socket (terminal servers, the echo device)
    Tcp,
}

/// Response-key derivation strategy for a device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorrelatorKind {
    /// The whole message is the key
    #[default]
    Echo,
    /// Function unit + command id, error code ignored
    FunctionUnit,
}

/// A logical device definition.
///
/// Devices naming the same `port` share one message manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceDefinition {
    /// Unique device name, used in RPC and property paths
    pub name: String,
    /// Transport type
    pub transport: TransportKind,
    /// Serial device path or `host:port` for TCP
    pub port: String,
    /// Baud rate (serial only)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Message terminator, e.g. "\r"
    #[serde(default = "default_terminator")]
    pub terminator: String,
    /// Response-key derivation
    #[serde(default)]
    pub correlator: CorrelatorKind,
    /// Response keys of unsolicited events to publish as properties
    #[serde(default)]
    pub event_keys: Vec<String>,
}

fn default_rpc_port() -> u16 {
    6000
}

fn default_interrupt_port() -> u16 {
    6001
}

fn default_property_port() -> u16 {
    6002
}

fn default_heartbeat_port() -> u16 {
    6003
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_read_timeout_ms() -> u64 {
    250
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_terminator() -> String {
    "\r".to_string()
}

impl ScopeConfig {
    /// Load from the default file location (if present) and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file (missing files are skipped) and the environment.
    ///
    /// The result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(ScopeConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a TOML string, without environment overrides.
    pub fn from_toml_str(source: &str) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(ScopeConfig::default()))
            .merge(Toml::string(source))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| ScopeError::Configuration(e.to_string()))
    }

    /// Semantic checks that parsing cannot express.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ScopeError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let ports = [
            self.server.rpc_port,
            self.server.interrupt_port,
            self.server.property_port,
            self.server.heartbeat_port,
        ];
        let distinct: HashSet<u16> = ports.iter().copied().collect();
        if distinct.len() != ports.len() {
            return Err(ScopeError::Configuration(format!(
                "rpc_port, interrupt_port, property_port and heartbeat_port must differ (got {:?})",
                ports
            )));
        }
        if self.server.heartbeat_interval_ms == 0 {
            return Err(ScopeError::Configuration(
                "heartbeat_interval_ms must be > 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.is_empty() || device.name.contains('.') {
                return Err(ScopeError::Configuration(format!(
                    "Device name '{}' must be non-empty and contain no '.'",
                    device.name
                )));
            }
            if !names.insert(device.name.as_str()) {
                return Err(ScopeError::Configuration(format!(
                    "Duplicate device name: '{}'",
                    device.name
                )));
            }
            if device.port.is_empty() {
                return Err(ScopeError::Configuration(format!(
                    "Device '{}': 'port' cannot be empty",
                    device.name
                )));
            }
            if device.terminator.is_empty() {
                return Err(ScopeError::Configuration(format!(
                    "Device '{}': 'terminator' cannot be empty",
                    device.name
                )));
            }
            if device.transport == TransportKind::Serial && device.baud_rate == 0 {
                return Err(ScopeError::Configuration(format!(
                    "Device '{}': 'baud_rate' must be > 0",
                    device.name
                )));
            }
        }

        // Devices sharing a port share a manager, so they must agree on framing.
        for a in &self.devices {
            for b in &self.devices {
                if a.port == b.port
                    && (a.transport != b.transport
                        || a.terminator != b.terminator
                        || a.baud_rate != b.baud_rate
                        || a.correlator != b.correlator)
                {
                    return Err(ScopeError::Configuration(format!(
                        "Devices '{}' and '{}' share port '{}' but disagree on transport settings",
                        a.name, b.name, a.port
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn device(name: &str, port: &str) -> DeviceDefinition {
        DeviceDefinition {
            name: name.to_string(),
            transport: TransportKind::Tcp,
            port: port.to_string(),
            baud_rate: 9600,
            terminator: "\r".to_string(),
            correlator: CorrelatorKind::Echo,
            event_keys: Vec::new(),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ScopeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.rpc_addr(), "127.0.0.1:6000");
        assert_eq!(config.server.property_addr(), "127.0.0.1:6002");
        assert_eq!(config.server.heartbeat_addr(), "127.0.0.1:6003");
        assert_eq!(config.server.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "bench"
log_level = "debug"

[server]
host = "0.0.0.0"
rpc_port = 7000

[[devices]]
name = "stand"
transport = "tcp"
port = "127.0.0.1:9000"
correlator = "function_unit"
event_keys = ["$71001"]
"#
        )
        .unwrap();

        let config = ScopeConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "bench");
        assert_eq!(config.server.rpc_port, 7000);
        assert_eq!(config.server.interrupt_port, 6001);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].correlator, CorrelatorKind::FunctionUnit);
        assert_eq!(config.devices[0].terminator, "\r");
        assert_eq!(config.devices[0].event_keys, vec!["$71001".to_string()]);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = ScopeConfig::load_from("/nonexistent/scope.toml").unwrap();
        assert_eq!(config.application.name, "scope");
    }

    #[test]
    fn test_duplicate_device_names_rejected() {
        let mut config = ScopeConfig::default();
        config.devices = vec![device("stage", "a:1"), device("stage", "b:2")];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate device name"));
    }

    #[test]
    fn test_shared_port_must_agree_on_framing() {
        let mut config = ScopeConfig::default();
        let mut other = device("lamp", "a:1");
        other.terminator = "\n".to_string();
        config.devices = vec![device("stage", "a:1"), other];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_colliding_ports_rejected() {
        let mut config = ScopeConfig::default();
        config.server.property_port = config.server.rpc_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_settings_validated() {
        let mut config = ScopeConfig::default();
        config.server.heartbeat_port = config.server.interrupt_port;
        assert!(config.validate().is_err());

        let mut config = ScopeConfig::default();
        config.server.heartbeat_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let result = ScopeConfig::from_toml_str("[application]\nname = \"x\"\nlog_level = \"loud\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_toml_round_trip_keeps_devices() {
        let mut config = ScopeConfig::default();
        config.devices = vec![device("stage", "127.0.0.1:9000")];
        let text = config.to_toml_string().unwrap();
        assert_eq!(ScopeConfig::from_toml_str(&text).unwrap(), config);
    }
}
