//! In-process lanes between a producer and a consumer.
//!
//! [`pair`] returns two [`Endpoint`]s and their [`Inbox`]es. Each endpoint
//! has a presence flag. The ephemeral lane is reachable only while both ends
//! are online, and requests fail fast otherwise. The producer's durable lane
//! is an unbounded queue that accepts envelopes at any time and hands them
//! to the consumer's inbox whenever the consumer is online. The relay puts
//! each payload version on it once, which bounds its growth.
//!
//! [`serve`] pumps an inbox into an [`InboundHandler`] until every sender is
//! gone.

use crate::error::{SyncError, SyncResult};
use crate::transport::{DurableLane, EphemeralLane, InboundHandler, LaneKind};
use pairsync_protocol::{Envelope, Reply};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Which end of a link an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The device originating records.
    Producer,
    /// The device merging records.
    Consumer,
}

#[derive(Debug, Clone, Copy)]
struct Presence {
    producer: bool,
    consumer: bool,
}

impl Presence {
    fn is_online(&self, side: Side) -> bool {
        match side {
            Side::Producer => self.producer,
            Side::Consumer => self.consumer,
        }
    }

    fn set(&mut self, side: Side, online: bool) {
        match side {
            Side::Producer => self.producer = online,
            Side::Consumer => self.consumer = online,
        }
    }

    fn both(&self) -> bool {
        self.producer && self.consumer
    }
}

/// One envelope taken from an inbox.
#[derive(Debug)]
pub struct Delivery {
    /// The envelope.
    pub envelope: Envelope,
    /// The lane it arrived on.
    pub lane: LaneKind,
    reply: Option<oneshot::Sender<Reply>>,
}

impl Delivery {
    /// Returns true if the sender is waiting for a reply.
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answers the sender. A no-op for deliveries that expect no reply.
    pub fn respond(self, reply: Reply) {
        if let Some(tx) = self.reply {
            // The requester may have timed out and gone away.
            let _ = tx.send(reply);
        }
    }
}

/// One end of an in-process link.
#[derive(Debug, Clone)]
pub struct Endpoint {
    side: Side,
    presence: Arc<watch::Sender<Presence>>,
    to_peer: mpsc::Sender<Delivery>,
    durable: Option<mpsc::UnboundedSender<Envelope>>,
}

impl Endpoint {
    /// Which end this is.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Marks this end online or offline.
    pub fn set_online(&self, online: bool) {
        let side = self.side;
        self.presence.send_modify(|p| p.set(side, online));
        debug!(?side, online, "link presence changed");
    }

    /// Returns true if this end is online.
    pub fn is_online(&self) -> bool {
        self.presence.borrow().is_online(self.side)
    }

    fn unavailable(lane: LaneKind) -> SyncError {
        SyncError::TransportUnavailable { lane }
    }
}

impl EphemeralLane for Endpoint {
    fn is_reachable(&self) -> bool {
        self.presence.borrow().both()
    }

    async fn request(&self, envelope: Envelope) -> SyncResult<Reply> {
        if !self.is_reachable() {
            return Err(Self::unavailable(LaneKind::Ephemeral));
        }
        let (tx, rx) = oneshot::channel();
        let delivery = Delivery {
            envelope,
            lane: LaneKind::Ephemeral,
            reply: Some(tx),
        };
        self.to_peer
            .send(delivery)
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    async fn send(&self, envelope: Envelope) -> SyncResult<()> {
        if !self.is_reachable() {
            return Err(Self::unavailable(LaneKind::Ephemeral));
        }
        let delivery = Delivery {
            envelope,
            lane: LaneKind::Ephemeral,
            reply: None,
        };
        self.to_peer
            .send(delivery)
            .await
            .map_err(|_| SyncError::Closed)
    }
}

impl DurableLane for Endpoint {
    async fn submit(&self, envelope: Envelope) -> SyncResult<()> {
        // Only the producer end has a durable lane.
        let Some(durable) = &self.durable else {
            return Err(Self::unavailable(LaneKind::Durable));
        };
        durable.send(envelope).map_err(|_| SyncError::Closed)
    }
}

/// Incoming envelopes for one end of a link.
#[derive(Debug)]
pub struct Inbox {
    side: Side,
    presence: watch::Receiver<Presence>,
    presence_open: bool,
    ephemeral: mpsc::Receiver<Delivery>,
    ephemeral_open: bool,
    durable: Option<mpsc::UnboundedReceiver<Envelope>>,
}

impl Inbox {
    /// Waits for the next delivery.
    ///
    /// Durable envelopes are held back while this end is offline. Returns
    /// `None` once nothing more can arrive.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let online = self.presence.borrow().is_online(self.side);
            let durable_ready = online && self.durable.is_some();

            tokio::select! {
                delivery = self.ephemeral.recv(), if self.ephemeral_open => match delivery {
                    Some(delivery) => return Some(delivery),
                    None => self.ephemeral_open = false,
                },
                envelope = recv_durable(&mut self.durable), if durable_ready => match envelope {
                    Some(envelope) => {
                        return Some(Delivery {
                            envelope,
                            lane: LaneKind::Durable,
                            reply: None,
                        })
                    }
                    None => self.durable = None,
                },
                changed = self.presence.changed(), if self.presence_open => {
                    if changed.is_err() {
                        self.presence_open = false;
                    }
                },
                else => return None,
            }
        }
    }
}

async fn recv_durable(durable: &mut Option<mpsc::UnboundedReceiver<Envelope>>) -> Option<Envelope> {
    match durable {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

/// Both ends of a link.
#[derive(Debug)]
pub struct Link {
    /// Producer endpoint: durable and ephemeral lanes to the consumer.
    pub producer: Endpoint,
    /// Envelopes sent to the producer.
    pub producer_inbox: Inbox,
    /// Consumer endpoint: ephemeral lane to the producer.
    pub consumer: Endpoint,
    /// Envelopes sent to the consumer.
    pub consumer_inbox: Inbox,
}

/// Creates a link with both ends online.
///
/// `capacity` bounds each direction of the ephemeral lane.
pub fn pair(capacity: usize) -> Link {
    let capacity = capacity.max(1);
    let (presence_tx, presence_rx) = watch::channel(Presence {
        producer: true,
        consumer: true,
    });
    let presence = Arc::new(presence_tx);

    let (to_consumer, consumer_rx) = mpsc::channel(capacity);
    let (to_producer, producer_rx) = mpsc::channel(capacity);
    let (durable_tx, durable_rx) = mpsc::unbounded_channel();

    Link {
        producer: Endpoint {
            side: Side::Producer,
            presence: Arc::clone(&presence),
            to_peer: to_consumer,
            durable: Some(durable_tx),
        },
        producer_inbox: Inbox {
            side: Side::Producer,
            presence: presence_rx.clone(),
            presence_open: true,
            ephemeral: producer_rx,
            ephemeral_open: true,
            durable: None,
        },
        consumer: Endpoint {
            side: Side::Consumer,
            presence,
            to_peer: to_producer,
            durable: None,
        },
        consumer_inbox: Inbox {
            side: Side::Consumer,
            presence: presence_rx,
            presence_open: true,
            ephemeral: consumer_rx,
            ephemeral_open: true,
            durable: Some(durable_rx),
        },
    }
}

/// Feeds every delivery in `inbox` to `handler` and answers requests.
///
/// Runs until the inbox is exhausted.
pub async fn serve<H: InboundHandler>(handler: Arc<H>, mut inbox: Inbox) {
    while let Some(Delivery {
        envelope,
        lane,
        reply,
    }) = inbox.recv().await
    {
        let response = handler.handle(envelope, lane).await;
        if let Some(tx) = reply {
            let _ = tx.send(response);
        }
    }
    debug!("inbox closed, serve loop stopped");
}
