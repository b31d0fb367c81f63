//! Error types for relay configuration and startup.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use rnet_core::NetError;

// ============================================================================
// Config Error
// ============================================================================

/// Errors raised while loading or validating a relay configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is not valid TOML for a relay configuration
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but describes an unusable setup
    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Relay Error
// ============================================================================

/// Errors raised while starting relays.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A route's listener could not be started
    #[error("Relay {name} failed to start: {source}")]
    Start {
        name: String,
        #[source]
        source: NetError,
    },
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
