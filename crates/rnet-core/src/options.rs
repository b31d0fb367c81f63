//! Connection and server options.
//!
//! Defaults: five retries one second apart, one minute receive and send
//! timeouts, keep-alive probes every 20 seconds after 40 idle seconds.

use std::time::Duration;

/// Number of receive retries after a transient failure.
pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// Pause between receive retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for a single read attempt.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for a single write.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for establishing an outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between unanswered keep-alive probes.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Idle time before the first keep-alive probe.
pub const DEFAULT_KEEP_ALIVE_TIME: Duration = Duration::from_secs(40);

// ============================================================================
// Retry Policy
// ============================================================================

/// How the receive loop reacts to transient read failures.
///
/// The policy is read once when a receive loop starts; changing it afterwards
/// does not affect a countdown already in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// A policy that gives up on the first transient failure.
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY)
    }
}

// ============================================================================
// Keep-Alive
// ============================================================================

/// TCP keep-alive settings for a connected socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub time: Duration,
}

impl KeepAliveConfig {
    /// Enabled keep-alive with the default interval and time.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            time: DEFAULT_KEEP_ALIVE_TIME,
        }
    }
}

// ============================================================================
// Connect Options
// ============================================================================

/// Options for an outbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub retry: RetryPolicy,
    pub receive_timeout: Duration,
    pub send_timeout: Duration,
    /// Applied right after the socket connects; `None` leaves the OS default
    pub keep_alive: Option<KeepAliveConfig>,
    /// `None` waits for the OS connect timeout
    pub connect_timeout: Option<Duration>,
    /// Start the connection before returning it
    pub auto_start: bool,
}

impl ConnectOptions {
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: KeepAliveConfig) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Return the connection un-started so settings can be adjusted first.
    #[must_use]
    pub fn deferred(mut self) -> Self {
        self.auto_start = false;
        self
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            keep_alive: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            auto_start: true,
        }
    }
}

// ============================================================================
// Server Options
// ============================================================================

/// Settings a server applies to every connection it accepts.
///
/// Read at accept time, so changes only affect connections accepted later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub client_receive_timeout: Duration,
    pub client_send_timeout: Duration,
    pub client_retry: RetryPolicy,
    pub client_keep_alive: Option<KeepAliveConfig>,
    /// Start accepted connections right after registering them. When false
    /// the consumer receives them un-started through the client-status
    /// stream and must start (or start and stop) each one itself.
    pub client_auto_start: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            client_receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            client_send_timeout: DEFAULT_SEND_TIMEOUT,
            client_retry: RetryPolicy::default(),
            client_keep_alive: None,
            client_auto_start: true,
        }
    }
}
