//! Simulate command implementation.
//!
//! Runs a producer and a consumer in one process over an in-process link
//! whose lanes lose messages at random, flips device presence while the
//! producer edits records, then keeps draining until both stores agree.

use pairsync_engine::link::{self, Endpoint, Link};
use pairsync_engine::{
    DurableLane, EphemeralLane, MemoryStore, Receiver, ReceiverStats, Relay, RelayStats, Store,
    SyncConfig, SyncError, SyncResult,
};
use pairsync_protocol::{Envelope, Reply, SessionRecord, Timestamp};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct Options {
    /// RNG seed; drawn at random when absent.
    pub seed: Option<u64>,
    /// Number of distinct records.
    pub records: usize,
    /// Number of producer edits.
    pub edits: usize,
    /// Per-message loss probability.
    pub loss: f64,
    /// Drain rounds allowed after the last edit.
    pub max_rounds: usize,
}

/// Outcome of a simulation run.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Seed that reproduces this run.
    pub seed: u64,
    /// Whether both stores agree and the outbox is empty.
    pub converged: bool,
    /// Drain rounds used after the last edit.
    pub settle_rounds: usize,
    /// Records on the producer.
    pub producer_records: usize,
    /// Records on the consumer.
    pub consumer_records: usize,
    /// Tombstoned records on the consumer.
    pub tombstones: usize,
    /// Messages the lossy lanes dropped.
    pub lost_messages: u64,
    /// Producer counters.
    pub relay: RelayStats,
    /// Consumer counters.
    pub receiver: ReceiverStats,
}

/// Shared randomness for the lossy lanes.
#[derive(Debug, Clone)]
struct Loss {
    rate: f64,
    rng: Arc<Mutex<StdRng>>,
    lost: Arc<AtomicU64>,
}

impl Loss {
    fn new(rate: f64, seed: u64) -> Self {
        Self {
            rate,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
            lost: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Decides whether the next message is lost.
    fn strikes(&self) -> bool {
        let lost = self.rng.lock().gen_bool(self.rate);
        if lost {
            self.lost.fetch_add(1, Ordering::Relaxed);
        }
        lost
    }

    fn coin(&self) -> bool {
        self.rng.lock().gen_bool(0.5)
    }

    fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

/// A lane that drops a share of the traffic passing through it.
#[derive(Debug, Clone)]
struct LossyLane<L> {
    inner: L,
    loss: Loss,
}

impl<L: DurableLane> DurableLane for LossyLane<L> {
    async fn submit(&self, envelope: Envelope) -> SyncResult<()> {
        if self.loss.strikes() {
            // Accepted by the lane, never delivered.
            debug!("durable envelope lost");
            return Ok(());
        }
        self.inner.submit(envelope).await
    }
}

impl<L: EphemeralLane> EphemeralLane for LossyLane<L> {
    fn is_reachable(&self) -> bool {
        self.inner.is_reachable()
    }

    async fn request(&self, envelope: Envelope) -> SyncResult<Reply> {
        if self.loss.strikes() {
            // Either the request or its reply goes missing.
            if self.loss.coin() {
                let _ = self.inner.request(envelope).await;
                debug!("ephemeral reply lost");
            } else {
                debug!("ephemeral request lost");
            }
            return Err(SyncError::transport_retryable("message lost"));
        }
        self.inner.request(envelope).await
    }

    async fn send(&self, envelope: Envelope) -> SyncResult<()> {
        if self.loss.strikes() {
            debug!("ephemeral message lost");
            return Ok(());
        }
        self.inner.send(envelope).await
    }
}

type SimRelay = Relay<MemoryStore, LossyLane<Endpoint>, LossyLane<Endpoint>>;
type SimReceiver = Receiver<MemoryStore, LossyLane<Endpoint>>;

/// Runs the simulate command. Returns whether the devices converged.
pub fn run(options: Options, format: &str) -> Result<bool, Box<dyn std::error::Error>> {
    let seed = options.seed.unwrap_or_else(|| rand::thread_rng().gen());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(simulate(&options, seed))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    Ok(report.converged)
}

async fn simulate(options: &Options, seed: u64) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    info!(seed, records = options.records, edits = options.edits, loss = options.loss, "starting simulation");

    let config = SyncConfig::new()
        .with_ack_timeout(Duration::from_millis(250))
        .with_drain_batch_size(options.records);
    let Link {
        producer,
        producer_inbox,
        consumer,
        consumer_inbox,
    } = link::pair(config.link_capacity);

    let loss = Loss::new(options.loss, seed.wrapping_add(1));
    let lossy = |inner: Endpoint| LossyLane {
        inner,
        loss: loss.clone(),
    };

    let relay: Arc<SimRelay> = Arc::new(Relay::new(
        config,
        Arc::new(MemoryStore::new()),
        lossy(producer.clone()),
        lossy(producer.clone()),
    ));
    let receiver: Arc<SimReceiver> = Arc::new(Receiver::new(
        Arc::new(MemoryStore::new()),
        lossy(consumer.clone()),
    ));

    let tasks = [
        tokio::spawn(link::serve(Arc::clone(&relay), producer_inbox)),
        tokio::spawn(link::serve(Arc::clone(&receiver), consumer_inbox)),
    ];

    let mut rng = StdRng::seed_from_u64(seed);
    let mut records: Vec<Option<SessionRecord>> = vec![None; options.records];
    let mut clock = Timestamp::from_secs(1_700_000_000);

    for _ in 0..options.edits {
        if rng.gen_bool(0.2) {
            let online = rng.gen_bool(0.6);
            if rng.gen_bool(0.5) {
                producer.set_online(online);
            } else {
                consumer.set_online(online);
            }
        }

        // Sometimes the clock stands still so that touch has to step it.
        clock = clock.saturating_add_millis(rng.gen_range(0..2_000));
        let slot = rng.gen_range(0..records.len());
        let record = edit(&mut rng, records[slot].take(), clock);
        relay.save_and_enqueue(&record).await?;
        records[slot] = Some(record);
    }

    producer.set_online(true);
    consumer.set_online(true);

    let mut settle_rounds = 0;
    let mut converged = is_converged(&relay, &receiver);
    while !converged && settle_rounds < options.max_rounds {
        settle_rounds += 1;
        relay.drain().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        converged = is_converged(&relay, &receiver);
    }

    for task in &tasks {
        task.abort();
    }

    let report = SimulationReport {
        seed,
        converged,
        settle_rounds,
        producer_records: relay.store().snapshot(|s| s.record_count()),
        consumer_records: receiver.store().snapshot(|s| s.record_count()),
        tombstones: receiver
            .store()
            .snapshot(|s| s.records().filter(|r| r.is_deleted()).count()),
        lost_messages: loss.lost(),
        relay: relay.stats(),
        receiver: receiver.stats(),
    };
    info!(converged, settle_rounds, "simulation finished");
    Ok(report)
}

/// Creates a record in an empty slot or mutates the existing one.
fn edit(rng: &mut StdRng, current: Option<SessionRecord>, now: Timestamp) -> SessionRecord {
    let Some(mut record) = current else {
        let id = uuid::Builder::from_random_bytes(rng.gen()).into_uuid();
        return SessionRecord::new(id, now, now);
    };

    if record.is_deleted() {
        return record;
    }

    match rng.gen_range(0..10) {
        0 => record.mark_deleted(now),
        1..=3 => {
            record.notes = Some(format!("note {}", rng.gen::<u16>()));
            record.touch(now);
        }
        4..=6 => {
            record.room_temperature = Some(f64::from(rng.gen_range(600..1000)) / 10.0);
            record.touch(now);
        }
        7 => {
            record.end_date = Some(now);
            record.touch(now);
        }
        _ => {
            record.category_id = Some(Uuid::new_v4());
            record.touch(now);
        }
    }
    record
}

fn is_converged(relay: &SimRelay, receiver: &SimReceiver) -> bool {
    if relay.pending_count() != 0 {
        return false;
    }
    relay.store().snapshot(|produced| {
        produced
            .records()
            .all(|record| receiver.store().get_record(&record.id).as_ref() == Some(record))
    })
}

fn print_text_output(report: &SimulationReport) {
    println!("Simulation (seed {})", report.seed);
    println!("================");
    println!();
    println!(
        "Converged:        {}",
        if report.converged { "yes" } else { "NO" }
    );
    println!("Settle rounds:    {}", report.settle_rounds);
    println!("Producer records: {}", report.producer_records);
    println!("Consumer records: {}", report.consumer_records);
    println!("Tombstones:       {}", report.tombstones);
    println!("Lost messages:    {}", report.lost_messages);
    println!();
    println!("Relay:");
    println!("  enqueued:           {}", report.relay.enqueued);
    println!("  coalesced:          {}", report.relay.coalesced);
    println!("  drains:             {}", report.relay.drains);
    println!("  attempts:           {}", report.relay.attempts);
    println!("  durable failures:   {}", report.relay.durable_failures);
    println!("  durable skipped:    {}", report.relay.durable_skipped);
    println!("  ephemeral failures: {}", report.relay.ephemeral_failures);
    println!("  acked:              {}", report.relay.acked);
    println!("  acks ignored:       {}", report.relay.acks_ignored);
    println!();
    println!("Receiver:");
    println!("  inserted:  {}", report.receiver.inserted);
    println!("  updated:   {}", report.receiver.updated);
    println!("  stale:     {}", report.receiver.stale);
    println!("  acks sent: {}", report.receiver.acks_sent);
}
