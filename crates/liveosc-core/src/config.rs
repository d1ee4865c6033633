//! Configuration file support for liveosc
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/liveosc/config.toml`
//! - macOS: `~/Library/Application Support/liveosc/config.toml`
//! - Windows: `%APPDATA%\liveosc\config.toml`

use crate::error::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port the peer listens on for our requests.
pub const DEFAULT_SEND_PORT: u16 = 9000;
/// Port we listen on for replies from the peer.
pub const DEFAULT_RECEIVE_PORT: u16 = 9001;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// UDP ports
    pub ports: Ports,
    /// Peer addressing
    pub peer: PeerSettings,
    /// Reply deadlines
    pub timeouts: TimeoutSettings,
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save configuration to the default config file location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "liveosc") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = r#"# liveosc configuration file

[ports]
# Port the device script listens on
send = 9000

# Port replies and MIDI events arrive on
receive = 9001

[peer]
# Host running the device script
host = "127.0.0.1"

# Local interface for the receive socket
bind_host = "0.0.0.0"

[timeouts]
# Default deadline for get/call/count replies, in milliseconds
reply_ms = 5000
"#;

        fs::write(&path, content)?;
        Ok(path)
    }

    /// Address requests are sent to, in "host:port" format.
    pub fn send_addr(&self) -> String {
        format!("{}:{}", self.peer.host, self.ports.send)
    }

    /// Address the receive socket binds to, in "host:port" format.
    pub fn receive_addr(&self) -> String {
        format!("{}:{}", self.peer.bind_host, self.ports.receive)
    }

    /// Default reply deadline for one-shot verbs.
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.reply_ms)
    }
}

/// Send/receive port pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ports {
    /// Outbound port on the peer
    pub send: u16,
    /// Local inbound port
    pub receive: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            send: DEFAULT_SEND_PORT,
            receive: DEFAULT_RECEIVE_PORT,
        }
    }
}

/// Peer addressing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    /// Host the peer runs on
    pub host: String,
    /// Interface the receive socket binds to
    pub bind_host: String,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            bind_host: "0.0.0.0".to_string(),
        }
    }
}

/// Reply deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Deadline for one-shot replies in milliseconds
    pub reply_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self { reply_ms: 5000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        let config = Config::default();
        assert_eq!(config.ports.send, 9000);
        assert_eq!(config.ports.receive, 9001);
        assert_eq!(config.send_addr(), "127.0.0.1:9000");
        assert_eq!(config.receive_addr(), "0.0.0.0:9001");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str("[ports]\nreceive = 7001\n").unwrap();
        assert_eq!(config.ports.send, 9000);
        assert_eq!(config.ports.receive, 7001);
        assert_eq!(config.peer.host, "127.0.0.1");
        assert_eq!(config.reply_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = Config::default();
        config.peer.host = "10.0.0.2".to_string();
        config.timeouts.reply_ms = 250;
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
