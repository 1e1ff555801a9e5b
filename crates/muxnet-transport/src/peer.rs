use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

/// Round trip ENet assumes for a peer before its first acknowledgement.
pub(crate) const DEFAULT_ROUND_TRIP: Duration = Duration::from_millis(500);

/// Handle of a peer within its host.
///
/// ENet recycles peer slots; the generation makes a handle to a departed peer
/// stay dead instead of reaching whoever takes its slot next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    pub(crate) slot: usize,
    pub(crate) generation: u32,
}

impl PeerId {
    /// ENet slot index.
    pub fn slot(self) -> usize {
        self.slot
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}.{}", self.slot, self.generation)
    }
}

/// Lifecycle of a peer as seen by its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Handshake sent, not yet confirmed.
    Connecting,
    Connected,
    /// Graceful close requested, waiting for the remote side.
    Disconnecting,
}

/// Round-trip statistics of a peer, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTrip {
    /// Most recent round-trip time reported by ENet.
    pub last_ms: u32,
    /// Smoothed mean deviation between successive reports.
    pub variance_ms: u32,
    /// Number of distinct reports taken.
    pub samples: u64,
}

impl RoundTrip {
    fn first(sample: u32) -> Self {
        Self {
            last_ms: sample,
            variance_ms: sample.div_ceil(2),
            samples: 1,
        }
    }

    fn update(&mut self, sample: u32) {
        let diff = sample.abs_diff(self.last_ms);
        self.variance_ms = (self.variance_ms * 3 + diff) / 4;
        self.last_ms = sample;
        self.samples += 1;
    }
}

/// Host-side bookkeeping for one ENet peer.
#[derive(Debug)]
pub(crate) struct Slot {
    pub generation: u32,
    pub state: PeerState,
    pub addr: SocketAddr,
    pub channel_count: usize,
    pub since: Instant,
    /// Sends issued before the handshake completed, in order.
    pub held: Vec<(u8, Bytes)>,
    round_trip: Option<RoundTrip>,
    last_report: Duration,
}

impl Slot {
    pub fn new(
        generation: u32,
        state: PeerState,
        addr: SocketAddr,
        channel_count: usize,
    ) -> Self {
        Self {
            generation,
            state,
            addr,
            channel_count,
            since: Instant::now(),
            held: Vec::new(),
            round_trip: None,
            last_report: DEFAULT_ROUND_TRIP,
        }
    }

    /// Fold in ENet's current round-trip time. Unchanged reports, including
    /// the default ENet starts from, are not samples.
    pub fn observe(&mut self, report: Duration) {
        if report == self.last_report {
            return;
        }
        self.last_report = report;
        let sample = u32::try_from(report.as_millis()).unwrap_or(u32::MAX);
        match &mut self.round_trip {
            Some(round_trip) => round_trip.update(sample),
            None => self.round_trip = Some(RoundTrip::first(sample)),
        }
    }

    pub fn round_trip(&self) -> Option<RoundTrip> {
        self.round_trip
    }
}
