//! Per-packet outcome reports and the master-side aggregator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Traffic direction of a stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Socket to device.
    Incoming,
    /// Device to socket.
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => f.write_str("incoming"),
            Direction::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// Outcome of one packet on one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub queue: usize,
    pub direction: Direction,
    pub dropped: bool,
    pub bytes: u64,
    /// Peer private IP, empty when the mapping was not resolved.
    #[serde(default)]
    pub private_ip: String,
}

/// Packet and byte counters for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
    pub dropped_packets: u64,
    pub dropped_bytes: u64,
}

impl Counters {
    fn record(&mut self, stat: &Stat) {
        if stat.dropped {
            self.dropped_packets += 1;
            self.dropped_bytes += stat.bytes;
        } else {
            self.packets += 1;
            self.bytes += stat.bytes;
        }
    }
}

/// Point-in-time copy of the aggregated counters.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub incoming: Counters,
    pub outgoing: Counters,
    pub queues: HashMap<(usize, Direction), Counters>,
    pub peers: HashMap<String, Counters>,
}

impl StatsSnapshot {
    fn direction_mut(&mut self, direction: Direction) -> &mut Counters {
        match direction {
            Direction::Incoming => &mut self.incoming,
            Direction::Outgoing => &mut self.outgoing,
        }
    }
}

/// Collects stats sunk by the workers.
///
/// Counters are cumulative; a background task logs a summary every
/// `report_interval`.
pub struct Aggregator {
    state: Arc<Mutex<StatsSnapshot>>,
    report_interval: Duration,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl Aggregator {
    /// Create an aggregator that reports every `report_interval`.
    pub fn new(report_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(StatsSnapshot::default())),
            report_interval,
            reporter: Mutex::new(None),
        }
    }

    /// Record one stat.
    pub fn sink(&self, stat: &Stat) {
        let mut state = lock(&self.state);
        state.direction_mut(stat.direction).record(stat);
        state
            .queues
            .entry((stat.queue, stat.direction))
            .or_default()
            .record(stat);
        if !stat.private_ip.is_empty() {
            state
                .peers
                .entry(stat.private_ip.clone())
                .or_default()
                .record(stat);
        }
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        lock(&self.state).clone()
    }

    /// Start the periodic report task. Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut reporter = lock(&self.reporter);
        if reporter.is_some() || self.report_interval.is_zero() {
            return;
        }
        let state = self.state.clone();
        let period = self.report_interval;
        *reporter = Some(tokio::spawn(async move {
            let mut timer = interval(period);
            // First tick fires immediately.
            timer.tick().await;
            loop {
                timer.tick().await;
                let snapshot = lock(&state).clone();
                log_report(&snapshot);
            }
        }));
    }

    /// Stop the report task and log a final summary.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.reporter).take() {
            handle.abort();
        }
        log_report(&self.snapshot());
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.reporter).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn log_report(snapshot: &StatsSnapshot) {
    log::info!(
        "[AGG] incoming: {} pkts / {} bytes ({} dropped), outgoing: {} pkts / {} bytes ({} dropped), {} peers",
        snapshot.incoming.packets,
        snapshot.incoming.bytes,
        snapshot.incoming.dropped_packets,
        snapshot.outgoing.packets,
        snapshot.outgoing.bytes,
        snapshot.outgoing.dropped_packets,
        snapshot.peers.len()
    );
    for (peer, counters) in &snapshot.peers {
        log::debug!(
            "[AGG] peer {}: {} pkts / {} bytes, {} dropped",
            peer,
            counters.packets,
            counters.bytes,
            counters.dropped_packets
        );
    }
}
