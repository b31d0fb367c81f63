//! rnet-relay - TCP relay built on reactive-net
//!
//! This crate pairs every client accepted on a listen address with a fresh
//! connection to a target and copies bytes between the two:
//! - `config` - TOML route configuration and validation
//! - `relay` - the `RelayServer` that owns a `Server` and bridges clients
//! - `error` - configuration and startup errors
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RelayServer                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │     Server      │────▶│        dispatcher           │   │
//! │  │ (deferred start)│     │  (one bridge per client)    │   │
//! │  └─────────────────┘     └──────────────┬──────────────┘   │
//! │                                         │                   │
//! │                                         ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ client          │◀───▶│ upstream Connection         │   │
//! │  │ Connection      │     │ (to target)                 │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`

pub mod config;
pub mod error;
pub mod relay;

pub use config::{RelayConfig, RouteConfig, CONFIG_ENV_VAR};
pub use error::{ConfigError, RelayError, Result};
pub use relay::RelayServer;

/// Validates `config` and starts one relay per route.
///
/// If any route fails to start, the ones already running are stopped again.
pub fn start_all(config: &RelayConfig) -> Result<Vec<RelayServer>> {
    config.validate()?;

    let mut started: Vec<RelayServer> = Vec::with_capacity(config.routes.len());
    for route in &config.routes {
        let relay = RelayServer::new(route);
        if let Err(source) = relay.start() {
            for running in &started {
                running.stop();
            }
            return Err(RelayError::Start {
                name: route.name.clone(),
                source,
            });
        }
        started.push(relay);
    }
    Ok(started)
}
