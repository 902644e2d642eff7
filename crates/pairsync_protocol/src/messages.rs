//! Protocol messages for sync.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{field, Fields, RecordId, SessionRecord};
use crate::settings::ConfigurationSnapshot;
use crate::time::Timestamp;
use crate::value::{Envelope, Value};

/// Highest schema version this build reads and the version it writes.
pub const PROTOCOL_VERSION: i64 = 1;

const TYPE_KEY: &str = "type";
const VERSION_KEY: &str = "v";
const STATUS_KEY: &str = "status";

/// The kind of a sync message, as carried in the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A session record.
    Session,
    /// An acknowledgment for a delivered record.
    Ack,
    /// A configuration snapshot.
    Config,
}

impl MessageKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Session => "session",
            MessageKind::Ack => "ack",
            MessageKind::Config => "config",
        }
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "session" => Some(MessageKind::Session),
            "ack" => Some(MessageKind::Ack),
            "config" => Some(MessageKind::Config),
            _ => None,
        }
    }
}

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// A record snapshot, producer to consumer.
    Session(SessionRecord),
    /// An acknowledgment, consumer to producer.
    Ack(AckMessage),
    /// A configuration snapshot, consumer to producer.
    Config(ConfigurationSnapshot),
}

impl SyncMessage {
    /// Returns the message kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            SyncMessage::Session(_) => MessageKind::Session,
            SyncMessage::Ack(_) => MessageKind::Ack,
            SyncMessage::Config(_) => MessageKind::Config,
        }
    }

    /// The dedupe key, for messages that have one.
    pub fn dedupe_key(&self) -> Option<RecordId> {
        match self {
            SyncMessage::Session(record) => Some(record.id),
            SyncMessage::Ack(ack) => Some(ack.dedupe_key),
            SyncMessage::Config(_) => None,
        }
    }

    /// Builds the wire envelope.
    pub fn to_envelope(&self) -> Envelope {
        let mut envelope = Envelope::new();
        envelope.insert(TYPE_KEY, self.kind().as_str());
        match self {
            SyncMessage::Session(record) => {
                envelope.insert(VERSION_KEY, PROTOCOL_VERSION);
                record.write_fields(&mut envelope);
            }
            SyncMessage::Ack(ack) => {
                envelope.insert(VERSION_KEY, PROTOCOL_VERSION);
                ack.write_fields(&mut envelope);
            }
            // Config envelopes are a flat settings map with no schema version.
            SyncMessage::Config(snapshot) => snapshot.write_fields(&mut envelope),
        }
        envelope
    }

    /// Validates an envelope and converts it to a typed message.
    ///
    /// # Errors
    ///
    /// - `UnknownType` if `type` is absent or unrecognized
    /// - `UnsupportedVersion` if a session/ack envelope is from a newer schema
    /// - `MissingField`/`InvalidField` for malformed fields
    pub fn from_envelope(envelope: &Envelope) -> ProtocolResult<Self> {
        let type_name = match envelope.get(TYPE_KEY) {
            None => return Err(ProtocolError::UnknownType("<missing>".into())),
            Some(Value::Text(name)) => name.as_str(),
            Some(other) => return Err(ProtocolError::UnknownType(other.type_name().into())),
        };
        let kind =
            MessageKind::parse(type_name).ok_or_else(|| ProtocolError::UnknownType(type_name.into()))?;

        match kind {
            MessageKind::Session => {
                check_version(envelope)?;
                SessionRecord::read_fields(envelope).map(SyncMessage::Session)
            }
            MessageKind::Ack => {
                check_version(envelope)?;
                AckMessage::read_fields(envelope).map(SyncMessage::Ack)
            }
            MessageKind::Config => Ok(SyncMessage::Config(ConfigurationSnapshot::read_fields(
                envelope,
            ))),
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        self.to_envelope().encode()
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Self::from_envelope(&Envelope::decode(bytes)?)
    }
}

fn check_version(envelope: &Envelope) -> ProtocolResult<()> {
    let version = match envelope.get(VERSION_KEY) {
        None => return Ok(()),
        Some(value) => value
            .as_integer()
            .ok_or_else(|| ProtocolError::invalid_field(VERSION_KEY, "expected an integer"))?,
    };
    if version > PROTOCOL_VERSION || version < 1 {
        return Err(ProtocolError::UnsupportedVersion {
            found: version,
            supported: PROTOCOL_VERSION,
        });
    }
    Ok(())
}

/// Acknowledgment that the consumer durably processed a record.
///
/// Acks are ephemeral and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMessage {
    /// Key of the acknowledged outbox item.
    pub dedupe_key: RecordId,
    /// `updatedAt` of the record copy that was processed, when known.
    pub updated_at: Option<Timestamp>,
}

impl AckMessage {
    /// Creates an ack that references the key only.
    pub fn new(dedupe_key: RecordId) -> Self {
        Self {
            dedupe_key,
            updated_at: None,
        }
    }

    /// Creates an ack for a specific record version.
    pub fn for_version(dedupe_key: RecordId, updated_at: Timestamp) -> Self {
        Self {
            dedupe_key,
            updated_at: Some(updated_at),
        }
    }

    fn write_fields(&self, envelope: &mut Envelope) {
        envelope.insert(field::DEDUPE_KEY, self.dedupe_key.to_string());
        envelope.insert_opt(field::UPDATED_AT, self.updated_at.map(Timestamp::as_secs_f64));
    }

    fn read_fields(envelope: &Envelope) -> ProtocolResult<Self> {
        let fields = Fields(envelope);
        Ok(Self {
            dedupe_key: fields.required_uuid(field::DEDUPE_KEY)?,
            updated_at: fields.optional_timestamp(field::UPDATED_AT)?,
        })
    }
}

/// Outcome reported by the ephemeral lane's request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    /// The message was processed and persisted (or was already current).
    Saved,
    /// The envelope's type is not handled by the receiver.
    UnknownType,
    /// The envelope failed validation; it will not be retried.
    Malformed,
    /// Local persistence failed; the sender should keep the item pending.
    Failed,
}

impl ReplyStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Saved => "saved",
            ReplyStatus::UnknownType => "unknown_type",
            ReplyStatus::Malformed => "malformed",
            ReplyStatus::Failed => "failed",
        }
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "saved" => Some(ReplyStatus::Saved),
            "unknown_type" => Some(ReplyStatus::UnknownType),
            "malformed" => Some(ReplyStatus::Malformed),
            "failed" => Some(ReplyStatus::Failed),
            _ => None,
        }
    }
}

/// Reply to an ephemeral-lane request: `{status: "..."}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Processing outcome.
    pub status: ReplyStatus,
}

impl Reply {
    /// A `saved` reply.
    pub fn saved() -> Self {
        Self {
            status: ReplyStatus::Saved,
        }
    }

    /// An `unknown_type` reply.
    pub fn unknown_type() -> Self {
        Self {
            status: ReplyStatus::UnknownType,
        }
    }

    /// A `malformed` reply.
    pub fn malformed() -> Self {
        Self {
            status: ReplyStatus::Malformed,
        }
    }

    /// A `failed` reply.
    pub fn failed() -> Self {
        Self {
            status: ReplyStatus::Failed,
        }
    }

    /// Returns true if the reply acknowledges the request.
    pub fn is_saved(&self) -> bool {
        self.status == ReplyStatus::Saved
    }

    /// Builds the reply envelope.
    pub fn to_envelope(&self) -> Envelope {
        let mut envelope = Envelope::new();
        envelope.insert(STATUS_KEY, self.status.as_str());
        envelope
    }

    /// Reads a reply envelope.
    pub fn from_envelope(envelope: &Envelope) -> ProtocolResult<Self> {
        let name = envelope
            .get(STATUS_KEY)
            .ok_or(ProtocolError::MissingField { field: STATUS_KEY })?
            .as_text()
            .ok_or_else(|| ProtocolError::invalid_field(STATUS_KEY, "expected text"))?;
        let status = ReplyStatus::parse(name)
            .ok_or_else(|| ProtocolError::invalid_field(STATUS_KEY, format!("unknown status {name}")))?;
        Ok(Self { status })
    }
}
