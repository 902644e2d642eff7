//! One-way configuration broadcast from consumer to producer.
//!
//! The consumer owns the configuration. It publishes full snapshots over the
//! ephemeral lane and re-sends the latest one whenever the producer becomes
//! reachable again. The producer replaces its cached copy on every receipt,
//! without a staleness check, so a delayed duplicate can briefly overwrite a
//! newer local edit. The producer is not expected to edit concurrently.

use crate::lifecycle::LifecycleEvent;
use crate::transport::EphemeralLane;
use pairsync_protocol::{ConfigurationSnapshot, SyncMessage, Value};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The producer's copy of the consumer-owned configuration.
#[derive(Debug)]
pub struct SettingsCache {
    current: watch::Sender<ConfigurationSnapshot>,
    applied: AtomicU64,
}

impl SettingsCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        let (current, _) = watch::channel(ConfigurationSnapshot::new());
        Self {
            current,
            applied: AtomicU64::new(0),
        }
    }

    /// Replaces the cached snapshot unconditionally.
    pub fn apply(&self, snapshot: ConfigurationSnapshot) {
        let keys = snapshot.len();
        self.current.send_replace(snapshot);
        self.applied.fetch_add(1, Ordering::Relaxed);
        info!(keys, "configuration applied");
    }

    /// Returns the cached snapshot.
    pub fn current(&self) -> ConfigurationSnapshot {
        self.current.borrow().clone()
    }

    /// Looks up one setting.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.current.borrow().get(key).cloned()
    }

    /// Subscribes to snapshot replacements.
    pub fn subscribe(&self) -> watch::Receiver<ConfigurationSnapshot> {
        self.current.subscribe()
    }

    /// Number of snapshots applied so far.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

impl Default for SettingsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes configuration snapshots from the consumer.
pub struct ConfigBroadcaster<E: EphemeralLane> {
    lane: E,
    latest: RwLock<Option<ConfigurationSnapshot>>,
    sent: AtomicU64,
}

impl<E: EphemeralLane> ConfigBroadcaster<E> {
    /// Creates a broadcaster over `lane`.
    pub fn new(lane: E) -> Self {
        Self {
            lane,
            latest: RwLock::new(None),
            sent: AtomicU64::new(0),
        }
    }

    /// Records `snapshot` as the latest and sends it if the producer is
    /// reachable. Returns true if it was sent.
    pub async fn publish(&self, snapshot: ConfigurationSnapshot) -> bool {
        *self.latest.write() = Some(snapshot);
        self.resend().await
    }

    /// Sends the latest snapshot again. Returns true if it was sent.
    pub async fn resend(&self) -> bool {
        let Some(snapshot) = self.latest.read().clone() else {
            return false;
        };
        if !self.lane.is_reachable() {
            debug!("producer unreachable; configuration held for reconnect");
            return false;
        }

        let envelope = SyncMessage::Config(snapshot).to_envelope();
        match self.lane.send(envelope).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                debug!("configuration sent");
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to send configuration");
                false
            }
        }
    }

    /// Re-sends the latest snapshot when the producer becomes reachable.
    pub async fn on_event(&self, event: LifecycleEvent) -> bool {
        if event.is_reconnect() {
            self.resend().await
        } else {
            false
        }
    }

    /// The most recently published snapshot.
    pub fn latest(&self) -> Option<ConfigurationSnapshot> {
        self.latest.read().clone()
    }

    /// Number of snapshots sent.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockEphemeralLane;

    fn snapshot(units: &str) -> ConfigurationSnapshot {
        ConfigurationSnapshot::new().with("units", units).unwrap()
    }

    #[test]
    fn cache_replaces_and_notifies() {
        let cache = SettingsCache::new();
        let mut rx = cache.subscribe();

        cache.apply(snapshot("celsius"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(cache.get("units"), Some(Value::Text("celsius".into())));

        // Older content still replaces: there is no staleness check.
        cache.apply(ConfigurationSnapshot::new());
        assert!(cache.current().is_empty());
        assert_eq!(cache.applied_count(), 2);
    }

    #[tokio::test]
    async fn publish_holds_until_reconnect() {
        let lane = MockEphemeralLane::new();
        lane.set_reachable(false);
        let broadcaster = ConfigBroadcaster::new(lane);

        assert!(!broadcaster.publish(snapshot("fahrenheit")).await);
        assert_eq!(broadcaster.sent_count(), 0);

        assert!(
            !broadcaster
                .on_event(LifecycleEvent::ReachabilityChanged { reachable: false })
                .await
        );

        broadcaster.lane.set_reachable(true);
        assert!(
            broadcaster
                .on_event(LifecycleEvent::ReachabilityChanged { reachable: true })
                .await
        );

        let sent = broadcaster.lane.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type(), Some("config"));
        assert_eq!(sent[0].get("units"), Some(&Value::Text("fahrenheit".into())));
    }

    #[tokio::test]
    async fn resend_without_snapshot_is_noop() {
        let broadcaster = ConfigBroadcaster::new(MockEphemeralLane::new());
        assert!(!broadcaster.resend().await);
        assert!(broadcaster.latest().is_none());
    }
}
