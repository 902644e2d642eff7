//! Consumer-side receiver and merge.

use crate::error::{SyncError, SyncResult};
use crate::store::Store;
use crate::transport::{EphemeralLane, InboundHandler, LaneKind};
use pairsync_protocol::{
    AckMessage, Envelope, RecordId, Reply, SessionRecord, SyncMessage, Timestamp,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of merging an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No record with the id existed; it was created.
    Inserted,
    /// The incoming copy was newer and replaced the stored one.
    Updated,
    /// The incoming copy was not newer; nothing changed.
    Stale,
}

impl MergeOutcome {
    /// Returns true if the store changed.
    pub fn is_applied(&self) -> bool {
        !matches!(self, MergeOutcome::Stale)
    }

    fn as_str(&self) -> &'static str {
        match self {
            MergeOutcome::Inserted => "inserted",
            MergeOutcome::Updated => "updated",
            MergeOutcome::Stale => "stale",
        }
    }
}

/// Counters describing receiver activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverStats {
    /// Records created.
    pub inserted: u64,
    /// Records replaced by a newer copy.
    pub updated: u64,
    /// Deliveries discarded as not newer.
    pub stale: u64,
    /// Envelopes rejected by validation.
    pub malformed: u64,
    /// Envelopes of a kind the receiver does not handle.
    pub unknown: u64,
    /// Acknowledgments sent, as replies or separate ack messages.
    pub acks_sent: u64,
    /// Merges whose commit failed.
    pub persistence_failures: u64,
}

/// The consumer's sync service.
///
/// Merging is whole-record last-writer-wins on `updatedAt`: an incoming
/// copy replaces the stored one only if its `updatedAt` is strictly greater.
/// Applying the same delivery any number of times, in any order, converges
/// on the copy with the greatest `updatedAt`.
pub struct Receiver<S: Store, E: EphemeralLane> {
    store: Arc<S>,
    ephemeral: E,
    stats: RwLock<ReceiverStats>,
}

impl<S: Store, E: EphemeralLane> Receiver<S, E> {
    /// Creates a receiver over the consumer's store and the ephemeral lane
    /// used for acknowledgments.
    pub fn new(store: Arc<S>, ephemeral: E) -> Self {
        Self {
            store,
            ephemeral,
            stats: RwLock::new(ReceiverStats::default()),
        }
    }

    /// The consumer's store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> ReceiverStats {
        self.stats.read().clone()
    }

    /// Records that are not tombstoned.
    pub fn active_records(&self) -> Vec<SessionRecord> {
        self.store.snapshot(|s| s.active_records())
    }

    /// Merges `incoming` into the store.
    pub fn merge(&self, incoming: SessionRecord) -> SyncResult<MergeOutcome> {
        let outcome = self.store.transaction(|txn| {
            let outcome = match txn.record(&incoming.id) {
                None => MergeOutcome::Inserted,
                Some(existing) if incoming.supersedes(existing) => MergeOutcome::Updated,
                Some(_) => MergeOutcome::Stale,
            };
            if outcome.is_applied() {
                txn.put_record(incoming);
            }
            Ok(outcome)
        })?;

        let mut stats = self.stats.write();
        match outcome {
            MergeOutcome::Inserted => stats.inserted += 1,
            MergeOutcome::Updated => stats.updated += 1,
            MergeOutcome::Stale => stats.stale += 1,
        }
        Ok(outcome)
    }

    /// Merges a record created on this device through a separate import
    /// path. Collisions with replicated records follow the same rule.
    pub fn import_local(&self, record: SessionRecord) -> SyncResult<MergeOutcome> {
        if record.id.is_nil() {
            return Err(SyncError::MissingRecordId);
        }
        self.merge(record)
    }

    /// Validates and merges one inbound envelope.
    ///
    /// Every successfully processed record is acknowledged, including stale
    /// copies: the producer's outbox entry would otherwise never clear.
    /// Ephemeral requests are acknowledged by the `saved` reply. Durable
    /// deliveries have no reply channel, so an ack message is sent over the
    /// ephemeral lane when it is live. A failed commit is not acknowledged.
    pub async fn handle_inbound(&self, envelope: Envelope, lane: LaneKind) -> Reply {
        let record = match SyncMessage::from_envelope(&envelope) {
            Ok(SyncMessage::Session(record)) => record,
            Ok(message) => {
                debug!(%lane, kind = message.kind().as_str(), "consumer ignores message kind");
                self.stats.write().unknown += 1;
                return Reply::unknown_type();
            }
            Err(e) if e.is_unknown_type() => {
                debug!(%lane, error = %e, "unknown message type");
                self.stats.write().unknown += 1;
                return Reply::unknown_type();
            }
            Err(e) => {
                warn!(%lane, error = %e, "dropping malformed message");
                self.stats.write().malformed += 1;
                return Reply::malformed();
            }
        };

        let key = record.id;
        let version = record.updated_at;
        match self.merge(record) {
            Ok(outcome) => {
                debug!(%lane, dedupe_key = %key, outcome = outcome.as_str(), "merged");
            }
            Err(e) => {
                warn!(%lane, dedupe_key = %key, error = %e, "merge failed, not acknowledging");
                self.stats.write().persistence_failures += 1;
                return Reply::failed();
            }
        }

        match lane {
            LaneKind::Ephemeral => {
                self.stats.write().acks_sent += 1;
            }
            LaneKind::Durable => self.send_ack(key, version).await,
        }
        Reply::saved()
    }

    async fn send_ack(&self, key: RecordId, version: Timestamp) {
        if !self.ephemeral.is_reachable() {
            debug!(dedupe_key = %key, "producer unreachable, ack deferred to redelivery");
            return;
        }
        let ack = SyncMessage::Ack(AckMessage::for_version(key, version)).to_envelope();
        match self.ephemeral.send(ack).await {
            Ok(()) => {
                self.stats.write().acks_sent += 1;
                debug!(dedupe_key = %key, "ack sent");
            }
            Err(e) => debug!(dedupe_key = %key, error = %e, "failed to send ack"),
        }
    }
}

impl<S: Store, E: EphemeralLane> InboundHandler for Receiver<S, E> {
    async fn handle(&self, envelope: Envelope, lane: LaneKind) -> Reply {
        self.handle_inbound(envelope, lane).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::MockEphemeralLane;
    use pairsync_protocol::ConfigurationSnapshot;
    use uuid::Uuid;

    fn receiver() -> Receiver<MemoryStore, MockEphemeralLane> {
        Receiver::new(Arc::new(MemoryStore::new()), MockEphemeralLane::new())
    }

    fn record(n: u128, updated_secs: i64) -> SessionRecord {
        SessionRecord::new(
            Uuid::from_u128(n),
            Timestamp::from_secs(10),
            Timestamp::from_secs(updated_secs),
        )
    }

    fn session(record: &SessionRecord) -> Envelope {
        SyncMessage::Session(record.clone()).to_envelope()
    }

    #[test]
    fn merge_is_last_writer_wins() {
        let receiver = receiver();
        assert_eq!(receiver.merge(record(1, 100)).unwrap(), MergeOutcome::Inserted);

        let mut newer = record(1, 200);
        newer.notes = Some("tired".into());
        assert_eq!(receiver.merge(newer.clone()).unwrap(), MergeOutcome::Updated);

        assert_eq!(receiver.merge(record(1, 150)).unwrap(), MergeOutcome::Stale);
        assert_eq!(receiver.merge(newer.clone()).unwrap(), MergeOutcome::Stale);
        assert_eq!(receiver.store().get_record(&Uuid::from_u128(1)), Some(newer));
    }

    #[test]
    fn import_local_requires_id() {
        let receiver = receiver();
        let mut rec = record(1, 100);
        rec.id = Uuid::nil();
        assert!(matches!(
            receiver.import_local(rec),
            Err(SyncError::MissingRecordId)
        ));
        assert_eq!(
            receiver.import_local(record(2, 100)).unwrap(),
            MergeOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn ephemeral_delivery_replies_saved_even_when_stale() {
        let receiver = receiver();
        receiver.merge(record(1, 100)).unwrap();

        let reply = receiver
            .handle_inbound(session(&record(1, 90)), LaneKind::Ephemeral)
            .await;
        assert_eq!(reply, Reply::saved());
        assert_eq!(
            receiver
                .store()
                .get_record(&Uuid::from_u128(1))
                .map(|r| r.updated_at),
            Some(Timestamp::from_secs(100))
        );
        assert_eq!(receiver.stats().acks_sent, 1);
        // The reply is the ack; nothing is sent separately.
        assert!(receiver.ephemeral.sent().is_empty());
    }

    #[tokio::test]
    async fn durable_delivery_sends_versioned_ack() {
        let receiver = receiver();
        receiver
            .handle_inbound(session(&record(1, 100)), LaneKind::Durable)
            .await;

        let sent = receiver.ephemeral.sent();
        assert_eq!(sent.len(), 1);
        match SyncMessage::from_envelope(&sent[0]).unwrap() {
            SyncMessage::Ack(ack) => {
                assert_eq!(ack.dedupe_key, Uuid::from_u128(1));
                assert_eq!(ack.updated_at, Some(Timestamp::from_secs(100)));
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sub_millisecond_newer_version_wins() {
        let receiver = receiver();
        let versioned = |secs: f64, notes: &str| {
            let mut rec = record(1, 0);
            rec.notes = Some(notes.into());
            let mut env = session(&rec);
            env.insert("updatedAt", secs);
            env
        };

        receiver
            .handle_inbound(versioned(1_700_000_100.0001, "older"), LaneKind::Durable)
            .await;
        receiver
            .handle_inbound(versioned(1_700_000_100.0004, "newer"), LaneKind::Durable)
            .await;

        let stored = receiver.store().get_record(&Uuid::from_u128(1)).unwrap();
        assert_eq!(stored.notes.as_deref(), Some("newer"));
        assert_eq!(stored.updated_at.as_secs_f64(), 1_700_000_100.0004);
        assert_eq!(receiver.stats().updated, 1);
    }

    #[tokio::test]
    async fn durable_delivery_without_peer_sends_no_ack() {
        let receiver = receiver();
        receiver.ephemeral.set_reachable(false);

        let reply = receiver
            .handle_inbound(session(&record(1, 100)), LaneKind::Durable)
            .await;
        assert_eq!(reply, Reply::saved());
        assert_eq!(receiver.active_records().len(), 1);
        assert_eq!(receiver.stats().acks_sent, 0);
    }

    #[tokio::test]
    async fn malformed_and_unknown_envelopes() {
        let receiver = receiver();

        let mut missing_start = session(&record(1, 100));
        missing_start.remove("startDate");
        assert_eq!(
            receiver
                .handle_inbound(missing_start, LaneKind::Ephemeral)
                .await,
            Reply::malformed()
        );

        let mut heartbeat = Envelope::new();
        heartbeat.insert("type", "heartbeat");
        assert_eq!(
            receiver.handle_inbound(heartbeat, LaneKind::Ephemeral).await,
            Reply::unknown_type()
        );

        let config = SyncMessage::Config(ConfigurationSnapshot::new()).to_envelope();
        assert_eq!(
            receiver.handle_inbound(config, LaneKind::Ephemeral).await,
            Reply::unknown_type()
        );

        let stats = receiver.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.unknown, 2);
        assert_eq!(receiver.store().snapshot(|s| s.record_count()), 0);
    }

    #[tokio::test]
    async fn persistence_failure_is_not_acknowledged() {
        let receiver = receiver();
        receiver.store().set_fail_commits(true);

        let reply = receiver
            .handle_inbound(session(&record(1, 100)), LaneKind::Durable)
            .await;
        assert_eq!(reply, Reply::failed());
        assert!(receiver.ephemeral.sent().is_empty());
        assert_eq!(receiver.stats().persistence_failures, 1);
    }

    #[tokio::test]
    async fn tombstone_hides_record() {
        let receiver = receiver();
        receiver
            .handle_inbound(session(&record(1, 100)), LaneKind::Ephemeral)
            .await;

        let mut deleted = record(1, 100);
        deleted.mark_deleted(Timestamp::from_secs(200));
        receiver
            .handle_inbound(session(&deleted), LaneKind::Ephemeral)
            .await;

        assert!(receiver.active_records().is_empty());
        let stored = receiver.store().get_record(&Uuid::from_u128(1)).unwrap();
        assert_eq!(stored.deleted_at, Some(Timestamp::from_secs(200)));
    }
}
