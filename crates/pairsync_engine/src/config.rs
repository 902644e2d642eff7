//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for relay and lane behaviour.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of outbox items submitted per drain.
    pub drain_batch_size: usize,
    /// How long a drain waits for an ephemeral reply before moving on.
    pub ack_timeout: Duration,
    /// Whether `enqueue` immediately drains.
    pub drain_on_enqueue: bool,
    /// Interval for periodic re-drains in `Relay::run`.
    pub wake_interval: Option<Duration>,
    /// Buffer size of in-process ephemeral lanes.
    pub link_capacity: usize,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            drain_batch_size: 50,
            ack_timeout: Duration::from_secs(10),
            drain_on_enqueue: true,
            wake_interval: None,
            link_capacity: 64,
        }
    }

    /// Sets the drain batch size (at least one).
    pub fn with_drain_batch_size(mut self, size: usize) -> Self {
        self.drain_batch_size = size.max(1);
        self
    }

    /// Sets the ephemeral reply timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets whether `enqueue` drains immediately.
    pub fn with_drain_on_enqueue(mut self, drain: bool) -> Self {
        self.drain_on_enqueue = drain;
        self
    }

    /// Enables periodic re-drains.
    pub fn with_wake_interval(mut self, interval: Duration) -> Self {
        self.wake_interval = Some(interval);
        self
    }

    /// Sets the in-process lane buffer size (at least one).
    pub fn with_link_capacity(mut self, capacity: usize) -> Self {
        self.link_capacity = capacity.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_drain_batch_size(10)
            .with_ack_timeout(Duration::from_millis(250))
            .with_drain_on_enqueue(false)
            .with_wake_interval(Duration::from_secs(60))
            .with_link_capacity(8);

        assert_eq!(config.drain_batch_size, 10);
        assert_eq!(config.ack_timeout, Duration::from_millis(250));
        assert!(!config.drain_on_enqueue);
        assert_eq!(config.wake_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.link_capacity, 8);
    }

    #[test]
    fn batch_size_never_zero() {
        let config = SyncConfig::new()
            .with_drain_batch_size(0)
            .with_link_capacity(0);
        assert_eq!(config.drain_batch_size, 1);
        assert_eq!(config.link_capacity, 1);
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.drain_batch_size, 50);
        assert!(config.drain_on_enqueue);
        assert!(config.wake_interval.is_none());
    }
}
