//! Outbox items: pending delivery intents.

use crate::error::ProtocolResult;
use crate::messages::SyncMessage;
use crate::record::{RecordId, SessionRecord};
use crate::time::Timestamp;
use crate::value::Envelope;
use serde::{Deserialize, Serialize};

/// Delivery status of an outbox item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for an acknowledgment. Failed attempts stay here.
    Pending,
    /// Acknowledged. Stores drop acked items when the write commits.
    Acked,
}

/// A pending delivery of one session record.
///
/// # Invariants
///
/// - at most one item exists per `dedupe_key`
/// - `payload` is a snapshot taken at enqueue time; later mutations of the
///   record must be re-enqueued to be delivered
/// - there is no failed terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    /// Equal to the record's id.
    pub dedupe_key: RecordId,
    /// Encoded `session` envelope.
    pub payload: Vec<u8>,
    /// `updatedAt` of the record snapshot in `payload`.
    pub payload_version: Timestamp,
    /// When the item was first enqueued.
    pub created_at: Timestamp,
    /// When the payload was last replaced.
    pub updated_at: Timestamp,
    /// Number of drain attempts.
    pub attempt_count: u32,
    /// Time of the last drain attempt.
    pub last_attempt_at: Option<Timestamp>,
    /// Payload version the durable lane has already accepted.
    #[serde(default)]
    pub durable_version: Option<Timestamp>,
    /// Delivery status.
    pub status: OutboxStatus,
}

impl OutboxItem {
    /// Creates a pending item holding a snapshot of `record`.
    pub fn new(record: &SessionRecord, now: Timestamp) -> ProtocolResult<Self> {
        Ok(Self {
            dedupe_key: record.id,
            payload: SyncMessage::Session(record.clone()).encode()?,
            payload_version: record.updated_at,
            created_at: now,
            updated_at: now,
            attempt_count: 0,
            last_attempt_at: None,
            durable_version: None,
            status: OutboxStatus::Pending,
        })
    }

    /// Replaces the payload with a newer snapshot and resets to pending.
    ///
    /// `created_at` and the attempt bookkeeping are kept, so a coalesced
    /// item keeps its place in the drain order.
    pub fn replace_payload(&mut self, record: &SessionRecord, now: Timestamp) -> ProtocolResult<()> {
        self.payload = SyncMessage::Session(record.clone()).encode()?;
        self.payload_version = record.updated_at;
        self.updated_at = now;
        self.status = OutboxStatus::Pending;
        Ok(())
    }

    /// Records a drain attempt.
    pub fn record_attempt(&mut self, now: Timestamp) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_at = Some(now);
    }

    /// Marks the item acknowledged.
    pub fn mark_acked(&mut self) {
        self.status = OutboxStatus::Acked;
    }

    /// Notes that the durable lane accepted the current payload.
    pub fn mark_durable_submitted(&mut self) {
        self.durable_version = Some(self.payload_version);
    }

    /// Returns true if the current payload still has to be handed to the
    /// durable lane. Each payload version is submitted there once.
    pub fn needs_durable_submit(&self) -> bool {
        self.durable_version != Some(self.payload_version)
    }

    /// Returns true if the item still awaits an acknowledgment.
    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }

    /// Returns true if an ack for `acked_version` covers this item's payload.
    ///
    /// An ack without a version covers whatever is queued.
    pub fn is_covered_by(&self, acked_version: Option<Timestamp>) -> bool {
        acked_version.map_or(true, |v| v >= self.payload_version)
    }

    /// Decodes the payload into a wire envelope.
    pub fn envelope(&self) -> ProtocolResult<Envelope> {
        Envelope::decode(&self.payload)
    }

    /// Decodes the payload back into the record snapshot.
    pub fn record(&self) -> ProtocolResult<SessionRecord> {
        match SyncMessage::decode(&self.payload)? {
            SyncMessage::Session(record) => Ok(record),
            other => Err(crate::ProtocolError::UnknownType(
                other.kind().as_str().to_string(),
            )),
        }
    }
}
