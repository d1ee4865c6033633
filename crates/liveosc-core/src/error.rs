//! Error types for liveosc

use std::time::Duration;
use thiserror::Error;

/// Result type alias for liveosc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the peer
#[derive(Debug, Error)]
pub enum Error {
    /// Socket error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// OSC encoding error
    #[error("OSC encode error: {0}")]
    Encode(#[from] rosc::OscError),

    /// Inbound datagram could not be decoded
    #[error("OSC decode error: {0}")]
    Decode(String),

    /// A verb was called with missing or empty arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No reply arrived before the caller's deadline
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// The exchange was torn down before a reply arrived
    #[error("Exchange was reset before a reply arrived")]
    Disconnected,

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}
