//! # pairsync Protocol
//!
//! Wire types and CBOR codecs for two-device session replication.
//!
//! This crate provides:
//! - `SessionRecord`, the replicated entity
//! - `OutboxItem` for pending deliveries
//! - The transport-agnostic `Envelope` key/value map
//! - `SyncMessage`, a tagged union of `session`, `ack` and `config` messages
//! - `Reply` for the ephemeral lane's request/response contract
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Validation
//!
//! Envelopes are validated at the boundary: decoding a `SyncMessage` either
//! yields a fully typed value or a `ProtocolError` naming the offending
//! field. Nothing downstream sees a partially valid record.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod outbox;
mod record;
mod settings;
mod time;
mod value;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{AckMessage, MessageKind, Reply, ReplyStatus, SyncMessage, PROTOCOL_VERSION};
pub use outbox::{OutboxItem, OutboxStatus};
pub use record::{RecordId, SessionRecord};
pub use settings::ConfigurationSnapshot;
pub use time::Timestamp;
pub use value::{Envelope, Value};
