//! Transport lane abstraction.
//!
//! A producer and consumer exchange envelopes over two independent lanes:
//!
//! - the durable lane is store-and-forward, producer to consumer only, and
//!   gives no confirmation
//! - the ephemeral lane is bidirectional and supports request/response, but
//!   only while both ends are live
//!
//! Lanes carry raw [`Envelope`]s. Validation happens at the receiving
//! handler, so a malformed envelope is answered rather than lost in transit.

use crate::error::{SyncError, SyncResult};
use pairsync_protocol::{Envelope, Reply};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identifies a transport lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneKind {
    /// Store-and-forward, unconfirmed.
    Durable,
    /// Live request/response.
    Ephemeral,
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaneKind::Durable => f.write_str("durable"),
            LaneKind::Ephemeral => f.write_str("ephemeral"),
        }
    }
}

/// A store-and-forward lane.
///
/// A successful `submit` means the envelope was handed to the lane, not that
/// it was delivered.
pub trait DurableLane: Send + Sync {
    /// Queues an envelope for eventual delivery.
    fn submit(&self, envelope: Envelope) -> impl Future<Output = SyncResult<()>> + Send;
}

/// A live bidirectional lane.
pub trait EphemeralLane: Send + Sync {
    /// Returns true if both endpoints are currently live.
    fn is_reachable(&self) -> bool;

    /// Sends an envelope and waits for the peer's reply.
    fn request(&self, envelope: Envelope) -> impl Future<Output = SyncResult<Reply>> + Send;

    /// Sends an envelope without waiting for a reply.
    fn send(&self, envelope: Envelope) -> impl Future<Output = SyncResult<()>> + Send;
}

/// Processes envelopes arriving on either lane.
pub trait InboundHandler: Send + Sync {
    /// Handles one envelope and produces the reply for the sender.
    ///
    /// The reply is delivered only when the envelope arrived as an
    /// ephemeral request.
    fn handle(&self, envelope: Envelope, lane: LaneKind) -> impl Future<Output = Reply> + Send;
}

/// A durable lane that records submissions, for testing.
#[derive(Debug, Default)]
pub struct MockDurableLane {
    submitted: Mutex<Vec<Envelope>>,
    failing: AtomicBool,
}

impl MockDurableLane {
    /// Creates a working lane.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every submission fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Envelopes submitted so far.
    pub fn submitted(&self) -> Vec<Envelope> {
        self.submitted.lock().clone()
    }

    /// Removes and returns submitted envelopes.
    pub fn take_submitted(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.submitted.lock())
    }
}

impl DurableLane for MockDurableLane {
    async fn submit(&self, envelope: Envelope) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("mock durable lane failure"));
        }
        self.submitted.lock().push(envelope);
        Ok(())
    }
}

/// An ephemeral lane with a scripted reply, for testing.
#[derive(Debug)]
pub struct MockEphemeralLane {
    reachable: AtomicBool,
    reply: Mutex<Reply>,
    requests: Mutex<Vec<Envelope>>,
    sent: Mutex<Vec<Envelope>>,
}

impl MockEphemeralLane {
    /// Creates a reachable lane that replies `saved`.
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            reply: Mutex::new(Reply::saved()),
            requests: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Sets reachability.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Sets the reply returned to every request.
    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock() = reply;
    }

    /// Envelopes sent as requests.
    pub fn requests(&self) -> Vec<Envelope> {
        self.requests.lock().clone()
    }

    /// Envelopes sent without waiting for a reply.
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }
}

impl Default for MockEphemeralLane {
    fn default() -> Self {
        Self::new()
    }
}

impl EphemeralLane for MockEphemeralLane {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn request(&self, envelope: Envelope) -> SyncResult<Reply> {
        if !self.is_reachable() {
            return Err(SyncError::TransportUnavailable {
                lane: LaneKind::Ephemeral,
            });
        }
        self.requests.lock().push(envelope);
        Ok(*self.reply.lock())
    }

    async fn send(&self, envelope: Envelope) -> SyncResult<()> {
        if !self.is_reachable() {
            return Err(SyncError::TransportUnavailable {
                lane: LaneKind::Ephemeral,
            });
        }
        self.sent.lock().push(envelope);
        Ok(())
    }
}
