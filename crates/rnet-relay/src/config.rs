//! Relay configuration file.
//!
//! ```toml
//! [[route]]
//! name = "game"
//! listen = "0.0.0.0:7777"
//! target = "10.0.0.5:7777"
//! receive_timeout_ms = 60000
//! keep_alive = true
//! ```
//!
//! Every field except `name`, `listen` and `target` is optional and falls
//! back to the connection defaults.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rnet_core::{
    ConnectOptions, KeepAliveConfig, RetryPolicy, ServerOptions, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_RECEIVE_TIMEOUT, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY, DEFAULT_SEND_TIMEOUT,
};

use crate::error::ConfigError;

/// Environment variable naming the default config file.
pub const CONFIG_ENV_VAR: &str = "RNET_RELAY_CONFIG";

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_receive_timeout_ms() -> u64 {
    millis(DEFAULT_RECEIVE_TIMEOUT)
}

fn default_send_timeout_ms() -> u64 {
    millis(DEFAULT_SEND_TIMEOUT)
}

fn default_connect_timeout_ms() -> u64 {
    millis(DEFAULT_CONNECT_TIMEOUT)
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRY_COUNT
}

fn default_retry_delay_ms() -> u64 {
    millis(DEFAULT_RETRY_DELAY)
}

// ============================================================================
// Route
// ============================================================================

/// One listen address relayed to one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    pub listen: SocketAddr,
    pub target: SocketAddr,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Enable TCP keep-alive on both legs
    #[serde(default)]
    pub keep_alive: bool,
}

impl RouteConfig {
    /// A route with default timeouts.
    pub fn new(name: impl Into<String>, listen: SocketAddr, target: SocketAddr) -> Self {
        Self {
            name: name.into(),
            listen,
            target,
            receive_timeout_ms: default_receive_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            keep_alive: false,
        }
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, Duration::from_millis(self.retry_delay_ms))
    }

    fn keep_alive_config(&self) -> Option<KeepAliveConfig> {
        self.keep_alive.then(KeepAliveConfig::enabled)
    }

    /// Options for the accepting side. Clients are handed over un-started
    /// so the relay can attach before the first read.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            client_receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            client_send_timeout: Duration::from_millis(self.send_timeout_ms),
            client_retry: self.retry(),
            client_keep_alive: self.keep_alive_config(),
            client_auto_start: false,
        }
    }

    /// Options for the upstream leg, also un-started.
    pub fn upstream_options(&self) -> ConnectOptions {
        ConnectOptions {
            retry: self.retry(),
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            keep_alive: self.keep_alive_config(),
            connect_timeout: Some(Duration::from_millis(self.connect_timeout_ms)),
            auto_start: false,
        }
    }
}

// ============================================================================
// Relay Config
// ============================================================================

/// Top-level configuration: a list of routes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteConfig>,
}

impl RelayConfig {
    /// Reads, parses and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parses and validates TOML text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// A single-route config, as built from command-line flags.
    pub fn single(route: RouteConfig) -> Self {
        Self {
            routes: vec![route],
        }
    }

    /// Checks that routes exist, are uniquely named and do not loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::Invalid("no routes configured".to_string()));
        }

        let mut names = HashSet::new();
        let mut listeners = HashSet::new();
        for route in &self.routes {
            if route.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "route listening on {} has an empty name",
                    route.listen
                )));
            }
            if !names.insert(route.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate route name '{}'",
                    route.name
                )));
            }
            if route.listen == route.target {
                return Err(ConfigError::Invalid(format!(
                    "route '{}' targets its own listen address {}",
                    route.name, route.listen
                )));
            }
            // Port 0 binds a fresh port each time
            if route.listen.port() != 0 && !listeners.insert(route.listen) {
                return Err(ConfigError::Invalid(format!(
                    "route '{}' reuses listen address {}",
                    route.name, route.listen
                )));
            }
        }
        Ok(())
    }
}
