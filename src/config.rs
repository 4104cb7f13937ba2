#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);
const DEFAULT_PREOPEN_RETRY_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(200);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(5_000);
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Configuration for bridge behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket endpoint the bridge connects to
    pub endpoint: String,
    /// Wall-clock deadline, measured from process start, for the first
    /// successful open. Exceeding it before ever opening is fatal.
    pub connect_timeout: Duration,
    /// Fixed delay between connect attempts before the first open
    pub preopen_retry_delay: Duration,
    /// Interval between liveness probes while the connection is open
    pub heartbeat_interval: Duration,
    /// Maximum time to wait for a Pong before forcing the connection closed.
    /// Must be shorter than `heartbeat_interval` so at most one probe is
    /// ever in flight.
    pub heartbeat_timeout: Duration,
    /// Maximum number of lines held while disconnected; oldest dropped first
    pub queue_capacity: usize,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Config {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            preopen_retry_delay: DEFAULT_PREOPEN_RETRY_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Configuration for automatic reconnection after a lost connection.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first reconnection attempt
    pub base_backoff: Duration,
    /// Cap on the exponential backoff delay
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl From<&ReconnectConfig> for ExponentialBackoff {
    fn from(config: &ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.base_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(2.0)
            // The reconnect schedule is part of the bridge contract, so no jitter.
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let config = ReconnectConfig::default();
        let mut backoff: ExponentialBackoff = (&config).into();

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn backoff_respects_cap() {
        let config = ReconnectConfig::default();
        let mut backoff: ExponentialBackoff = (&config).into();

        for _ in 0..20 {
            let delay = backoff.next_backoff().expect("backoff never exhausts");
            assert!(
                delay <= config.max_backoff,
                "delay {delay:?} exceeds cap {:?}",
                config.max_backoff
            );
        }
    }

    #[test]
    fn backoff_resets_to_base() {
        let config = ReconnectConfig::default();
        let mut backoff: ExponentialBackoff = (&config).into();

        let _first = backoff.next_backoff();
        let _second = backoff.next_backoff();
        backoff.reset();

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn default_timeout_is_shorter_than_interval() {
        let config = Config::new("ws://localhost:1");
        assert!(
            config.heartbeat_timeout < config.heartbeat_interval,
            "probe timeout must fit inside the probe interval"
        );
    }
}
