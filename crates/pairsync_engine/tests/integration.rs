//! End-to-end tests for relay, receiver and lanes.

use pairsync_engine::link::{self, Endpoint, Link};
use pairsync_engine::spool::{SpoolReader, SpoolWriter};
use pairsync_engine::{
    ConfigBroadcaster, EphemeralLane, FileStore, LifecycleEvent, MemoryStore, MockEphemeralLane,
    Receiver, Relay, Store, SyncConfig,
};
use pairsync_protocol::{ConfigurationSnapshot, SessionRecord, SyncMessage, Timestamp, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use uuid::Uuid;

type LinkedRelay = Relay<MemoryStore, Endpoint, Endpoint>;
type LinkedReceiver = Receiver<MemoryStore, Endpoint>;

struct Pair {
    relay: Arc<LinkedRelay>,
    receiver: Arc<LinkedReceiver>,
    producer: Endpoint,
    consumer: Endpoint,
}

/// Wires a relay and receiver over an in-process link and serves both
/// inboxes in the background.
fn connect() -> Pair {
    let config = SyncConfig::new()
        .with_drain_on_enqueue(false)
        .with_ack_timeout(Duration::from_secs(2));
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

    tokio::spawn(link::serve(Arc::clone(&relay), producer_inbox));
    tokio::spawn(link::serve(Arc::clone(&receiver), consumer_inbox));

    Pair {
        relay,
        receiver,
        producer,
        consumer,
    }
}

fn record(n: u128, updated_secs: i64) -> SessionRecord {
    SessionRecord::new(
        Uuid::from_u128(n),
        Timestamp::from_secs(1_000),
        Timestamp::from_secs(updated_secs),
    )
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn stored_version(receiver: &LinkedReceiver, n: u128) -> Option<Timestamp> {
    receiver
        .store()
        .get_record(&Uuid::from_u128(n))
        .map(|r| r.updated_at)
}

#[tokio::test]
async fn durable_only_delivery_then_ephemeral_ack() {
    let pair = connect();

    // The producer is backgrounded, so only the durable lane carries the
    // record and no ack comes back.
    pair.producer.set_online(false);
    pair.relay.stage(&record(1, 100)).unwrap();
    let report = pair.relay.drain().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.acked, 0);

    eventually(|| stored_version(&pair.receiver, 1).is_some()).await;
    assert_eq!(stored_version(&pair.receiver, 1), Some(Timestamp::from_secs(100)));
    assert_eq!(pair.receiver.stats().acks_sent, 0);
    assert_eq!(pair.relay.pending_count(), 1);

    // The ephemeral lane comes up and redelivers the same payload. The
    // receiver treats it as stale and still acknowledges.
    pair.producer.set_online(true);
    let report = pair
        .relay
        .on_event(LifecycleEvent::ReachabilityChanged { reachable: true })
        .await
        .unwrap();
    assert_eq!(report.attempted, 1);
    eventually(|| pair.relay.pending_count() == 0).await;

    eventually(|| pair.receiver.stats().stale >= 1).await;
    assert_eq!(pair.receiver.stats().inserted, 1);
    assert_eq!(pair.receiver.stats().updated, 0);
}

#[tokio::test]
async fn stale_delivery_still_clears_outbox() {
    let pair = connect();

    // The consumer already holds a newer copy from its own import path.
    pair.receiver.import_local(record(1, 100)).unwrap();
    pair.relay.stage(&record(1, 90)).unwrap();

    pair.relay.drain().await;
    eventually(|| pair.relay.pending_count() == 0).await;
    assert_eq!(stored_version(&pair.receiver, 1), Some(Timestamp::from_secs(100)));
}

#[tokio::test]
async fn out_of_order_deliveries_converge() {
    // Newer then older, and older then newer.
    for order in [[50, 30], [30, 50]] {
        let receiver = Receiver::new(Arc::new(MemoryStore::new()), MockEphemeralLane::new());
        for updated in order {
            let env = SyncMessage::Session(record(2, updated)).to_envelope();
            receiver
                .handle_inbound(env, pairsync_engine::LaneKind::Durable)
                .await;
        }
        assert_eq!(
            receiver
                .store()
                .get_record(&Uuid::from_u128(2))
                .map(|r| r.updated_at),
            Some(Timestamp::from_secs(50))
        );
    }
}

#[tokio::test]
async fn repeated_delivery_is_idempotent() {
    let pair = connect();
    let mut rec = record(3, 100);
    rec.notes = Some("steady".into());
    rec.room_temperature = Some(80.5);

    for _ in 0..3 {
        pair.relay.stage(&rec).unwrap();
        pair.relay.drain().await;
    }

    eventually(|| pair.receiver.stats().stale >= 2).await;
    assert_eq!(pair.receiver.store().get_record(&rec.id), Some(rec));
    assert_eq!(pair.receiver.store().snapshot(|s| s.record_count()), 1);
}

#[tokio::test]
async fn coalesced_enqueue_delivers_latest_payload() {
    let pair = connect();
    pair.producer.set_online(false);

    pair.relay.stage(&record(4, 100)).unwrap();
    pair.relay.stage(&record(4, 200)).unwrap();
    assert_eq!(pair.relay.pending_count(), 1);

    pair.producer.set_online(true);
    pair.relay.drain().await;

    eventually(|| stored_version(&pair.receiver, 4).is_some()).await;
    assert_eq!(stored_version(&pair.receiver, 4), Some(Timestamp::from_secs(200)));
    assert_eq!(pair.relay.pending_count(), 0);
}

#[tokio::test]
async fn durable_ack_keeps_newer_reenqueued_item() {
    let pair = connect();

    // The durable copy of version 100 arrives while the ephemeral lane is
    // up, so the receiver sends a versioned ack. Meanwhile the producer has
    // queued version 200, which must survive that ack.
    pair.relay.stage(&record(5, 200)).unwrap();
    let stale_copy = SyncMessage::Session(record(5, 100)).to_envelope();
    pair.receiver
        .handle_inbound(stale_copy, pairsync_engine::LaneKind::Durable)
        .await;

    eventually(|| pair.relay.stats().acks_ignored >= 1).await;
    assert_eq!(pair.relay.pending_count(), 1);
}

#[tokio::test]
async fn duplicate_acks_are_harmless() {
    let pair = connect();
    pair.producer.set_online(false);
    pair.relay.stage(&record(6, 100)).unwrap();
    pair.relay.stage(&record(7, 100)).unwrap();

    assert!(pair.relay.handle_ack(Uuid::from_u128(6)).unwrap());
    assert!(!pair.relay.handle_ack(Uuid::from_u128(6)).unwrap());
    assert!(!pair.relay.handle_ack(Uuid::new_v4()).unwrap());

    assert_eq!(pair.relay.pending_count(), 1);
    assert!(pair
        .relay
        .store()
        .get_outbox_item(&Uuid::from_u128(7))
        .is_some());
}

#[tokio::test]
async fn tombstone_propagates() {
    let pair = connect();
    let mut rec = record(8, 100);
    pair.relay.save_and_enqueue(&rec).await.unwrap();
    pair.relay.drain().await;
    assert_eq!(pair.receiver.active_records().len(), 1);

    rec.mark_deleted(Timestamp::from_secs(300));
    pair.relay.save_and_enqueue(&rec).await.unwrap();
    pair.relay.drain().await;

    assert!(pair.receiver.active_records().is_empty());
    assert_eq!(
        pair.receiver
            .store()
            .get_record(&rec.id)
            .and_then(|r| r.deleted_at),
        Some(Timestamp::from_secs(300))
    );
}

#[tokio::test]
async fn configuration_reaches_producer_after_reconnect() {
    let pair = connect();
    let broadcaster = ConfigBroadcaster::new(pair.consumer.clone());

    pair.producer.set_online(false);
    let snapshot = ConfigurationSnapshot::new()
        .with("units", "fahrenheit")
        .unwrap()
        .with("reminders", true)
        .unwrap();
    assert!(!broadcaster.publish(snapshot).await);

    pair.producer.set_online(true);
    assert!(pair.consumer.is_reachable());
    assert!(
        broadcaster
            .on_event(LifecycleEvent::ReachabilityChanged { reachable: true })
            .await
    );

    eventually(|| pair.relay.settings().applied_count() == 1).await;
    assert_eq!(
        pair.relay.settings().get("units"),
        Some(Value::Text("fahrenheit".into()))
    );
    assert_eq!(pair.relay.settings().get("reminders"), Some(Value::Bool(true)));
}

#[tokio::test]
async fn spool_lane_survives_restart() {
    let temp = tempdir().unwrap();
    let spool_dir = temp.path().join("spool");
    let producer_dir = temp.path().join("producer");

    // The producer queues and drains with no live peer, then exits.
    {
        let ephemeral = MockEphemeralLane::new();
        ephemeral.set_reachable(false);
        let relay = Relay::new(
            SyncConfig::new(),
            Arc::new(FileStore::open(&producer_dir).unwrap()),
            SpoolWriter::open(&spool_dir).unwrap(),
            ephemeral,
        );
        relay.save_and_enqueue(&record(9, 100)).await.unwrap();
        assert_eq!(relay.pending_count(), 1);
    }

    // The outbox item survives the restart.
    let producer_store = FileStore::open(&producer_dir).unwrap();
    assert_eq!(producer_store.snapshot(|s| s.pending_count()), 1);

    // The consumer picks up the spooled envelope later.
    let consumer_lane = MockEphemeralLane::new();
    consumer_lane.set_reachable(false);
    let receiver = Receiver::new(Arc::new(MemoryStore::new()), consumer_lane);
    let reader = SpoolReader::open(&spool_dir).unwrap();
    let report = reader.deliver(&receiver).await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(receiver.active_records().len(), 1);
    assert_eq!(receiver.stats().acks_sent, 0);
}

#[tokio::test]
async fn run_loop_drains_on_foreground() {
    let pair = connect();
    pair.relay.stage(&record(10, 100)).unwrap();

    let (tx, rx) = tokio::sync::mpsc::channel(4);
    let relay = Arc::clone(&pair.relay);
    let task = tokio::spawn(async move { relay.run(rx).await });

    tx.send(LifecycleEvent::Foreground).await.unwrap();
    eventually(|| pair.relay.pending_count() == 0).await;

    drop(tx);
    task.await.unwrap();
    assert_eq!(stored_version(&pair.receiver, 10), Some(Timestamp::from_secs(100)));
}
