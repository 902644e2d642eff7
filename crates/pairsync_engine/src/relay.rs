//! Producer-side outbox relay.
//!
//! The relay owns the outbox. Every mutation that should reach the consumer
//! is enqueued under its record id; re-enqueuing the same id replaces the
//! queued snapshot instead of adding a second item. A drain submits every
//! pending item over the durable lane and, when the consumer is live, also
//! over the ephemeral lane, where a `saved` reply deletes the item.
//!
//! Failures are never terminal. A submission that fails, times out or is
//! answered with anything but `saved` leaves the item pending for the next
//! drain, which lifecycle events and reachability changes trigger.

use crate::broadcast::SettingsCache;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::LifecycleEvent;
use crate::store::{Store, Transaction};
use crate::transport::{DurableLane, EphemeralLane, InboundHandler, LaneKind};
use pairsync_protocol::{
    Envelope, OutboxItem, RecordId, Reply, SessionRecord, SyncMessage, Timestamp,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Counters describing relay activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Items created in the outbox.
    pub enqueued: u64,
    /// Enqueues that replaced an existing item's payload.
    pub coalesced: u64,
    /// Drains that ran.
    pub drains: u64,
    /// Drains suppressed because one was already running.
    pub drains_skipped: u64,
    /// Delivery attempts across all drains.
    pub attempts: u64,
    /// Durable lane submissions that failed.
    pub durable_failures: u64,
    /// Durable submissions skipped because the lane already held the payload.
    pub durable_skipped: u64,
    /// Ephemeral requests that failed or timed out.
    pub ephemeral_failures: u64,
    /// Outbox items deleted by an acknowledgment.
    pub acked: u64,
    /// Acknowledgments that matched no item or an older payload.
    pub acks_ignored: u64,
    /// Configuration snapshots applied.
    pub configs_applied: u64,
}

/// Result of one drain call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Items submitted.
    pub attempted: usize,
    /// Items acknowledged and deleted during this drain.
    pub acked: usize,
    /// Durable lane submissions that failed.
    pub durable_failures: usize,
    /// Durable submissions skipped because the lane already held the payload.
    pub durable_skipped: usize,
    /// Ephemeral requests that failed or timed out.
    pub ephemeral_failures: usize,
    /// True if another drain was running and this one did nothing.
    pub skipped: bool,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Clears the drain flag when dropped.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The producer's sync service.
pub struct Relay<S: Store, D: DurableLane, E: EphemeralLane> {
    config: SyncConfig,
    store: Arc<S>,
    durable: D,
    ephemeral: E,
    draining: AtomicBool,
    stats: RwLock<RelayStats>,
    settings: SettingsCache,
}

impl<S: Store, D: DurableLane, E: EphemeralLane> Relay<S, D, E> {
    /// Creates a relay over the producer's store and both lanes.
    pub fn new(config: SyncConfig, store: Arc<S>, durable: D, ephemeral: E) -> Self {
        Self {
            config,
            store,
            durable,
            ephemeral,
            draining: AtomicBool::new(false),
            stats: RwLock::new(RelayStats::default()),
            settings: SettingsCache::new(),
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The producer's store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The configuration received from the consumer.
    pub fn settings(&self) -> &SettingsCache {
        &self.settings
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> RelayStats {
        self.stats.read().clone()
    }

    /// Returns true while a drain is running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Number of outbox items awaiting acknowledgment.
    pub fn pending_count(&self) -> usize {
        self.store.snapshot(|s| s.pending_count())
    }

    /// Queues a snapshot of `record` without draining.
    ///
    /// Returns true if an existing item for the same id was replaced.
    ///
    /// # Errors
    ///
    /// Returns `MissingRecordId` if the record has no id, or a persistence
    /// error if the outbox could not be written.
    pub fn stage(&self, record: &SessionRecord) -> SyncResult<bool> {
        check_id(record)?;
        let now = Timestamp::now();
        let coalesced = self.store.transaction(|txn| stage_in(txn, record, now))?;
        self.note_staged(record.id, coalesced);
        Ok(coalesced)
    }

    /// Queues a snapshot of `record` and drains if configured to.
    pub async fn enqueue(&self, record: &SessionRecord) -> SyncResult<()> {
        self.stage(record)?;
        if self.config.drain_on_enqueue {
            self.drain().await;
        }
        Ok(())
    }

    /// Saves `record` as the authoritative copy and queues it in the same
    /// transaction, then drains if configured to.
    pub async fn save_and_enqueue(&self, record: &SessionRecord) -> SyncResult<()> {
        check_id(record)?;
        let now = Timestamp::now();
        let coalesced = self.store.transaction(|txn| {
            txn.put_record(record.clone());
            stage_in(txn, record, now)
        })?;
        self.note_staged(record.id, coalesced);

        if self.config.drain_on_enqueue {
            self.drain().await;
        }
        Ok(())
    }

    /// Re-queues every record in the producer's store.
    ///
    /// Returns the number of records queued.
    pub async fn enqueue_all(&self) -> SyncResult<usize> {
        let records: Vec<SessionRecord> = self.store.snapshot(|s| s.records().cloned().collect());
        let now = Timestamp::now();

        let coalesced = self.store.transaction(|txn| {
            let mut coalesced = 0;
            for record in &records {
                if stage_in(txn, record, now)? {
                    coalesced += 1;
                }
            }
            Ok(coalesced)
        })?;

        {
            let mut stats = self.stats.write();
            stats.coalesced += coalesced as u64;
            stats.enqueued += (records.len() - coalesced) as u64;
        }
        info!(records = records.len(), "re-enqueued all records");

        if self.config.drain_on_enqueue {
            self.drain().await;
        }
        Ok(records.len())
    }

    /// Delivers up to the batch size of pending items.
    ///
    /// Items never attempted go first, then the least recently attempted,
    /// so every item is eventually handed to the durable lane even when the
    /// outbox is larger than one batch. Each payload version is submitted to
    /// the durable lane once; the ephemeral lane is retried on every drain.
    ///
    /// Returns immediately with a skipped report if a drain is already
    /// running.
    pub async fn drain(&self) -> DrainReport {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            debug!("drain already in progress, skipping");
            self.stats.write().drains_skipped += 1;
            return DrainReport::skipped();
        };

        let batch = self
            .store
            .snapshot(|s| s.pending_outbox(self.config.drain_batch_size));
        let mut report = DrainReport::default();
        if !batch.is_empty() {
            debug!(items = batch.len(), "draining outbox");
        }

        for item in batch {
            self.deliver(item, &mut report).await;
        }

        {
            let mut stats = self.stats.write();
            stats.drains += 1;
            stats.attempts += report.attempted as u64;
            stats.durable_failures += report.durable_failures as u64;
            stats.durable_skipped += report.durable_skipped as u64;
            stats.ephemeral_failures += report.ephemeral_failures as u64;
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                acked = report.acked,
                durable_failures = report.durable_failures,
                ephemeral_failures = report.ephemeral_failures,
                "drain complete"
            );
        }
        report
    }

    async fn deliver(&self, item: OutboxItem, report: &mut DrainReport) {
        let key = item.dedupe_key;
        let now = Timestamp::now();

        // The item may have been acked or replaced since the batch was read.
        let item = match self.store.transaction(|txn| {
            let Some(mut current) = txn.outbox_item(&key).cloned() else {
                return Ok(None);
            };
            if !current.is_pending() {
                return Ok(None);
            }
            current.record_attempt(now);
            txn.put_outbox(current.clone());
            Ok(Some(current))
        }) {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                warn!(dedupe_key = %key, error = %e, "failed to record attempt");
                item
            }
        };

        let envelope = match item.envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(dedupe_key = %key, error = %e, "outbox payload unreadable");
                return;
            }
        };
        report.attempted += 1;

        if item.needs_durable_submit() {
            match self.durable.submit(envelope.clone()).await {
                Ok(()) => self.note_durable_submitted(key, item.payload_version),
                Err(e) => {
                    warn!(
                        dedupe_key = %key,
                        lane = %LaneKind::Durable,
                        attempt = item.attempt_count,
                        retryable = e.is_retryable(),
                        error = %e,
                        "submission failed"
                    );
                    report.durable_failures += 1;
                }
            }
        } else {
            debug!(dedupe_key = %key, "payload already on the durable lane");
            report.durable_skipped += 1;
        }

        if !self.ephemeral.is_reachable() {
            return;
        }
        match self.request(envelope).await {
            Ok(reply) if reply.is_saved() => {
                match self.acknowledge(key, Some(item.payload_version)) {
                    Ok(true) => report.acked += 1,
                    Ok(false) => {}
                    Err(e) => warn!(dedupe_key = %key, error = %e, "failed to delete acked item"),
                }
            }
            Ok(reply) => {
                debug!(
                    dedupe_key = %key,
                    status = reply.status.as_str(),
                    "request not acknowledged"
                );
            }
            Err(e) => {
                warn!(
                    dedupe_key = %key,
                    lane = %LaneKind::Ephemeral,
                    attempt = item.attempt_count,
                    retryable = e.is_retryable(),
                    error = %e,
                    "submission failed"
                );
                report.ephemeral_failures += 1;
            }
        }
    }

    /// Records that the durable lane holds `version` of the item for `key`,
    /// unless the item has since been acked or replaced.
    fn note_durable_submitted(&self, key: RecordId, version: Timestamp) {
        let result = self.store.transaction(|txn| {
            if let Some(mut item) = txn.outbox_item(&key).cloned() {
                if item.payload_version == version {
                    item.mark_durable_submitted();
                    txn.put_outbox(item);
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            // The next drain submits the payload again.
            warn!(dedupe_key = %key, error = %e, "failed to record durable submission");
        }
    }

    async fn request(&self, envelope: Envelope) -> SyncResult<Reply> {
        tokio::time::timeout(self.config.ack_timeout, self.ephemeral.request(envelope))
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    /// Deletes the outbox item for `key`.
    ///
    /// Safe to call any number of times; a key with no item is a no-op.
    /// Returns true if an item was deleted.
    pub fn handle_ack(&self, key: RecordId) -> SyncResult<bool> {
        self.acknowledge(key, None)
    }

    /// Deletes the outbox item for `key` if `version` covers its payload.
    ///
    /// An ack without a version covers any payload. An ack for an older
    /// version leaves a re-enqueued item pending.
    pub fn acknowledge(&self, key: RecordId, version: Option<Timestamp>) -> SyncResult<bool> {
        let deleted = self.store.transaction(|txn| {
            let Some(mut item) = txn.outbox_item(&key).cloned() else {
                return Ok(false);
            };
            if !item.is_covered_by(version) {
                return Ok(false);
            }
            item.mark_acked();
            txn.put_outbox(item);
            Ok(true)
        })?;

        let mut stats = self.stats.write();
        if deleted {
            stats.acked += 1;
            debug!(dedupe_key = %key, "outbox item acknowledged");
        } else {
            stats.acks_ignored += 1;
            debug!(dedupe_key = %key, "acknowledgment matched no pending payload");
        }
        Ok(deleted)
    }

    /// Reacts to a lifecycle event. Returns the drain report if it drained.
    pub async fn on_event(&self, event: LifecycleEvent) -> Option<DrainReport> {
        debug!(?event, "lifecycle event");
        if event.triggers_drain() {
            Some(self.drain().await)
        } else {
            None
        }
    }

    /// Drains on every lifecycle event and wake tick until `events` closes.
    pub async fn run(&self, mut events: mpsc::Receiver<LifecycleEvent>) {
        let mut wake = self.config.wake_interval.map(|period| {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.on_event(event).await;
                    }
                    None => break,
                },
                _ = next_tick(&mut wake) => {
                    self.on_event(LifecycleEvent::PeriodicWake).await;
                }
            }
        }
        debug!("lifecycle channel closed, relay stopped");
    }

    fn note_staged(&self, key: RecordId, coalesced: bool) {
        let mut stats = self.stats.write();
        if coalesced {
            stats.coalesced += 1;
            debug!(dedupe_key = %key, "coalesced into existing outbox item");
        } else {
            stats.enqueued += 1;
            debug!(dedupe_key = %key, "enqueued");
        }
    }
}

impl<S: Store, D: DurableLane, E: EphemeralLane> InboundHandler for Relay<S, D, E> {
    async fn handle(&self, envelope: Envelope, lane: LaneKind) -> Reply {
        match SyncMessage::from_envelope(&envelope) {
            Ok(SyncMessage::Ack(ack)) => match self.acknowledge(ack.dedupe_key, ack.updated_at) {
                Ok(_) => Reply::saved(),
                Err(e) => {
                    warn!(dedupe_key = %ack.dedupe_key, error = %e, "failed to apply ack");
                    Reply::failed()
                }
            },
            Ok(SyncMessage::Config(snapshot)) => {
                self.settings.apply(snapshot);
                self.stats.write().configs_applied += 1;
                Reply::saved()
            }
            Ok(message) => {
                debug!(%lane, kind = message.kind().as_str(), "producer ignores message kind");
                Reply::unknown_type()
            }
            Err(e) if e.is_unknown_type() => {
                debug!(%lane, error = %e, "unknown message type");
                Reply::unknown_type()
            }
            Err(e) => {
                warn!(%lane, error = %e, "dropping malformed message");
                Reply::malformed()
            }
        }
    }
}

fn check_id(record: &SessionRecord) -> SyncResult<()> {
    if record.id.is_nil() {
        return Err(SyncError::MissingRecordId);
    }
    Ok(())
}

/// Upserts the outbox item for `record`. Returns true if it replaced one.
fn stage_in(txn: &mut Transaction<'_>, record: &SessionRecord, now: Timestamp) -> SyncResult<bool> {
    match txn.outbox_item(&record.id).cloned() {
        Some(mut item) => {
            item.replace_payload(record, now)?;
            txn.put_outbox(item);
            Ok(true)
        }
        None => {
            txn.put_outbox(OutboxItem::new(record, now)?);
            Ok(false)
        }
    }
}

async fn next_tick(wake: &mut Option<Interval>) {
    match wake {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
