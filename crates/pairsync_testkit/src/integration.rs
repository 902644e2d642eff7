//! A producer/consumer pair for integration tests.

use pairsync_engine::link::{self, Endpoint, Link, Side};
use pairsync_engine::{MemoryStore, Receiver, Relay, Store, SyncConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Relay type used by [`PairHarness`].
pub type HarnessRelay = Relay<MemoryStore, Endpoint, Endpoint>;

/// Receiver type used by [`PairHarness`].
pub type HarnessReceiver = Receiver<MemoryStore, Endpoint>;

/// A relay and a receiver connected over an in-process link.
///
/// Both inboxes are served by background tasks which are aborted when the
/// harness is dropped. Must be created inside a Tokio runtime.
pub struct PairHarness {
    relay: Arc<HarnessRelay>,
    receiver: Arc<HarnessReceiver>,
    producer: Endpoint,
    consumer: Endpoint,
    tasks: Vec<JoinHandle<()>>,
}

impl PairHarness {
    /// Wires up a fresh pair with empty in-memory stores.
    pub fn start(config: SyncConfig) -> Self {
        let Link {
            producer,
            producer_inbox,
            consumer,
            consumer_inbox,
        } = link::pair(config.link_capacity);

        let relay = Arc::new(Relay::new(
            config,
            Arc::new(MemoryStore::new()),
            producer.clone(),
            producer.clone(),
        ));
        let receiver = Arc::new(Receiver::new(
            Arc::new(MemoryStore::new()),
            consumer.clone(),
        ));

        let tasks = vec![
            tokio::spawn(link::serve(Arc::clone(&relay), producer_inbox)),
            tokio::spawn(link::serve(Arc::clone(&receiver), consumer_inbox)),
        ];

        Self {
            relay,
            receiver,
            producer,
            consumer,
            tasks,
        }
    }

    /// Wires up a pair whose relay only drains when asked.
    pub fn manual() -> Self {
        Self::start(
            SyncConfig::new()
                .with_drain_on_enqueue(false)
                .with_ack_timeout(Duration::from_secs(2)),
        )
    }

    /// The producer's relay.
    pub fn relay(&self) -> &Arc<HarnessRelay> {
        &self.relay
    }

    /// The consumer's receiver.
    pub fn receiver(&self) -> &Arc<HarnessReceiver> {
        &self.receiver
    }

    /// The producer's end of the link.
    pub fn producer(&self) -> &Endpoint {
        &self.producer
    }

    /// The consumer's end of the link.
    pub fn consumer(&self) -> &Endpoint {
        &self.consumer
    }

    /// Marks one side online or offline.
    pub fn set_online(&self, side: Side, online: bool) {
        match side {
            Side::Producer => self.producer.set_online(online),
            Side::Consumer => self.consumer.set_online(online),
        }
    }

    /// Drains and waits until the outbox is empty, polling for up to two
    /// seconds. Returns true if it emptied.
    pub async fn settle(&self) -> bool {
        self.relay.drain().await;
        self.wait_until(|h| h.relay.pending_count() == 0).await
    }

    /// Polls `check` every 10 ms for up to two seconds.
    pub async fn wait_until(&self, check: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..200 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check(self)
    }

    /// Returns true if the outbox is empty and every record the producer
    /// holds is present on the consumer at the same version.
    pub fn is_converged(&self) -> bool {
        if self.relay.pending_count() != 0 {
            return false;
        }
        let produced = self.relay.store().snapshot(|s| s.records().cloned().collect::<Vec<_>>());
        produced.iter().all(|record| {
            self.receiver
                .store()
                .get_record(&record.id)
                .is_some_and(|stored| stored.updated_at == record.updated_at)
        })
    }
}

impl Drop for PairHarness {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::record;

    #[tokio::test]
    async fn harness_converges_when_online() {
        let harness = PairHarness::manual();
        harness.relay().save_and_enqueue(&record(1, 100)).await.unwrap();
        harness.relay().save_and_enqueue(&record(2, 100)).await.unwrap();

        assert!(harness.settle().await);
        assert!(harness.is_converged());
        assert_eq!(harness.receiver().active_records().len(), 2);
    }

    #[tokio::test]
    async fn offline_consumer_delays_convergence() {
        let harness = PairHarness::manual();
        harness.set_online(Side::Consumer, false);
        harness.relay().save_and_enqueue(&record(1, 100)).await.unwrap();
        harness.relay().drain().await;
        assert!(!harness.is_converged());

        harness.set_online(Side::Consumer, true);
        assert!(harness.settle().await);
        assert!(harness.is_converged());
    }
}
