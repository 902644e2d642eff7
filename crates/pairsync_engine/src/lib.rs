//! # pairsync Engine
//!
//! Outbox relay, idempotent receiver and delivery lanes for replicating
//! session records from a producer device to a consumer device.
//!
//! This crate provides:
//! - [`Relay`]: the producer's outbox (enqueue, coalesce, drain, ack)
//! - [`Receiver`]: the consumer's last-writer-wins merge and acks
//! - [`ConfigBroadcaster`] and [`SettingsCache`]: one-way configuration push
//! - Lane traits with in-process ([`link`]) and file-backed ([`spool`])
//!   implementations
//! - [`Store`] with in-memory and file-backed implementations
//!
//! ## Delivery model
//!
//! ```text
//!   producer                                   consumer
//!   ┌────────┐  durable (store-and-forward)   ┌──────────┐
//!   │ Relay  │ ─────────────────────────────▶ │ Receiver │
//!   │ outbox │ ◀────────────────────────────▶ │  merge   │
//!   └────────┘  ephemeral (request / reply)   └──────────┘
//! ```
//!
//! Every drain submits each pending item over both lanes. The consumer
//! tolerates the resulting duplicates because merging is idempotent.
//!
//! ## Key Invariants
//!
//! - At most one outbox item per record id
//! - An outbox item is deleted only by an acknowledgment
//! - A stored record is replaced only by a copy with a strictly greater
//!   `updatedAt`
//! - Stale deliveries are still acknowledged
//! - Failures leave items pending; the next drain retries

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod broadcast;
mod config;
mod error;
mod lifecycle;
pub mod link;
mod receiver;
mod relay;
pub mod spool;
mod store;
mod transport;

pub use broadcast::{ConfigBroadcaster, SettingsCache};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use lifecycle::LifecycleEvent;
pub use receiver::{MergeOutcome, Receiver, ReceiverStats};
pub use relay::{DrainReport, Relay, RelayStats};
pub use store::{ChangeSet, FileStore, MemoryStore, Store, StoreState, Transaction};
pub use transport::{
    DurableLane, EphemeralLane, InboundHandler, LaneKind, MockDurableLane, MockEphemeralLane,
};

/// Engine crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
