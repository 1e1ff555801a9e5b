//! Connections: one logical, bidirectional path to a remote endpoint.
//!
//! A client connection owns a single-peer transport host of its own. A
//! server-side connection shares its server's host and only refers to the
//! server weakly.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use muxnet_frame::{validate_channel, Channel, InboundQueue, MessageIterator};
use muxnet_transport::{Address, Event, Host, RoundTrip};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::completion::{Completion, CompletionQueue, CompletionTicket, SendReceipt};
use crate::error::{NetError, Result};
use crate::hosts::Endpoint;
use crate::latency::LatencyTracker;
use crate::pipeline::{Destination, PendingSend, Target};
use crate::runtime::{NetworkRuntime, Shared};
use crate::server::{Server, ServerInner};

/// Shortest pause between checks while waiting on the network.
const MIN_PAUSE: Duration = Duration::from_millis(1);

/// Connection lifecycle.
///
/// `WaitingToConnect -> JustConnected -> Connected -> WaitingToDisconnect ->
/// Disconnected`, plus a direct edge to `Disconnected` from any state on forced
/// teardown or an unexpected transport disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// A client connect was requested; the handshake has not completed.
    WaitingToConnect = 0,
    /// The handshake completed. Becomes `Connected` on the first send or the
    /// first request for an inbound iterator.
    JustConnected = 1,
    /// In use: something was sent or an inbound iterator was requested.
    Connected = 2,
    /// A graceful close is in progress.
    WaitingToDisconnect = 3,
    /// Terminal. Sends are dropped.
    Disconnected = 4,
}

impl Status {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::WaitingToConnect,
            1 => Self::JustConnected,
            2 => Self::Connected,
            3 => Self::WaitingToDisconnect,
            _ => Self::Disconnected,
        }
    }

    /// Lowercase name, as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingToConnect => "waiting_to_connect",
            Self::JustConnected => "just_connected",
            Self::Connected => "connected",
            Self::WaitingToDisconnect => "waiting_to_disconnect",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) enum Side {
    /// Owns the host in its endpoint.
    Client,
    /// Lives on a server's host.
    Server(Weak<ServerInner>),
}

#[derive(Default)]
struct LatencyState {
    tracker: LatencyTracker,
    last_samples: u64,
}

pub(crate) struct ConnectionInner {
    pub(crate) id: u64,
    shared: Arc<Shared>,
    side: Side,
    status: AtomicU8,
    endpoint: Mutex<Option<Endpoint>>,
    address: Address,
    /// Requested until the handshake completes, negotiated afterwards.
    channel_count: AtomicUsize,
    inbound: Mutex<BTreeMap<Channel, Arc<InboundQueue>>>,
    latency: Mutex<LatencyState>,
    completions: Arc<CompletionQueue>,
}

impl ConnectionInner {
    pub(crate) fn new(
        shared: Arc<Shared>,
        side: Side,
        status: Status,
        endpoint: Endpoint,
        address: Address,
        channel_count: usize,
    ) -> Self {
        let id = shared.next_id();
        Self {
            id,
            shared,
            side,
            status: AtomicU8::new(status as u8),
            endpoint: Mutex::new(Some(endpoint)),
            address,
            channel_count: AtomicUsize::new(channel_count),
            inbound: Mutex::new(BTreeMap::new()),
            latency: Mutex::default(),
            completions: Arc::default(),
        }
    }

    pub(crate) fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Still worth servicing.
    pub(crate) fn is_live(&self) -> bool {
        self.status() != Status::Disconnected
    }

    fn endpoint(&self) -> Option<Endpoint> {
        *self.endpoint.lock()
    }

    fn transition(&self, from: Status, to: Status) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channel_count.load(Ordering::Acquire)
    }

    /// The handshake completed with `negotiated` channels, which may be fewer
    /// than requested when the server allows fewer.
    fn on_connected(&self, negotiated: Option<usize>) {
        if let Some(negotiated) = negotiated {
            let requested = self.channel_count.swap(negotiated, Ordering::AcqRel);
            if negotiated < requested {
                warn!(connection = self.id, requested, negotiated, "server accepted fewer channels");
            }
        }
        if self.transition(Status::WaitingToConnect, Status::JustConnected) {
            info!(connection = self.id, address = %self.address, "connected");
        }
    }

    fn promote(&self) {
        if self.transition(Status::JustConnected, Status::Connected) {
            trace!(connection = self.id, "connection active");
        }
    }

    /// Move to `WaitingToDisconnect` unless already disconnected.
    fn begin_disconnect(&self) -> bool {
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                (raw != Status::Disconnected as u8).then_some(Status::WaitingToDisconnect as u8)
            })
            .is_ok()
    }

    fn inbound_queue(&self, channel: Channel) -> Arc<InboundQueue> {
        Arc::clone(
            self.inbound.lock()
                .entry(channel)
                .or_insert_with(|| Arc::new(InboundQueue::new(channel))),
        )
    }

    pub(crate) fn deliver(&self, channel: Channel, packet: Bytes) {
        if let Err(err) = self.inbound_queue(channel).half_push_back(packet) {
            error!(connection = self.id, channel, error = %err, "malformed message header, message dropped");
        }
    }

    pub(crate) fn refresh_latency(&self, round_trip: Option<RoundTrip>) {
        let Some(round_trip) = round_trip else {
            return;
        };
        let mut state = self.latency.lock();
        if round_trip.samples == state.last_samples {
            return;
        }
        state.last_samples = round_trip.samples;
        state.tracker.update(
            f64::from(round_trip.last_ms),
            f64::from(round_trip.variance_ms),
        );
    }

    /// The transport reported the peer gone, or its server stopped.
    pub(crate) fn mark_disconnected(&self) {
        self.endpoint.lock().take();
        let previous = self
            .status
            .swap(Status::Disconnected as u8, Ordering::AcqRel);
        if previous != Status::Disconnected as u8 {
            info!(connection = self.id, address = %self.address, "disconnected");
        }
    }

    /// Poll this client's own host. Called by the receiver loop, or by
    /// `service_network` without background threads.
    pub(crate) fn service_client(&self) {
        let Some(endpoint) = self.endpoint() else {
            return;
        };
        let (polled, round_trip) = {
            let mut table = self.shared.lock_hosts();
            let polled = table.poll(endpoint.host);
            (polled, table.round_trip(endpoint))
        };
        let Some(polled) = polled else {
            self.mark_disconnected();
            return;
        };

        for event in polled.events {
            if event.peer() != endpoint.peer {
                trace!(connection = self.id, ?event, "event for a stale peer ignored");
                continue;
            }
            match event {
                Event::Connect { peer } => {
                    self.on_connected(polled.peers.get(&peer).map(|snapshot| snapshot.channel_count));
                }
                Event::Receive {
                    channel, packet, ..
                } => self.deliver(channel, packet),
                Event::Disconnect { .. } => {
                    self.shared.lock_hosts().remove(endpoint.host);
                    self.mark_disconnected();
                    return;
                }
            }
        }
        self.refresh_latency(round_trip);
    }

    /// Flush what this connection queued, drop the transport peer without a
    /// handshake and mark the connection disconnected.
    pub(crate) fn force_teardown(&self) {
        self.shared.pipeline.flush_origin(self.id);
        let endpoint = self.endpoint.lock().take();

        if let Some(endpoint) = endpoint {
            let mut table = self.shared.lock_hosts();
            match &self.side {
                Side::Client => {
                    if let Some(mut host) = table.remove(endpoint.host) {
                        reset(&mut host, endpoint);
                    }
                }
                Side::Server(server) => {
                    if let Some(host) = table.get_mut(endpoint.host) {
                        reset(host, endpoint);
                    }
                    drop(table);
                    if let Some(server) = server.upgrade() {
                        server.forget(endpoint.peer);
                    }
                }
            }
        }
        self.mark_disconnected();
    }

    fn checked_channel(&self, channel: usize) -> Result<Channel> {
        let limit = self.channel_count();
        validate_channel(channel, limit).map_err(|_| NetError::InvalidChannel { channel, limit })
    }

    fn enqueue(
        &self,
        msg_type: u32,
        header: Bytes,
        payload: Bytes,
        channel: Channel,
        completion: Option<Completion>,
    ) -> Result<()> {
        let status = self.status();
        let endpoint = match (status, self.endpoint()) {
            (Status::WaitingToDisconnect | Status::Disconnected, _) | (_, None) => {
                warn!(connection = self.id, %status, channel, msg_type, "send on a closed connection dropped");
                if let Some(completion) = completion {
                    completion.finish(false);
                }
                return Ok(());
            }
            (_, Some(endpoint)) => endpoint,
        };
        self.promote();

        self.shared.pipeline.enqueue(PendingSend {
            msg_type,
            channel,
            header,
            payload,
            destination: Destination {
                host: endpoint.host,
                target: Target::Peer(endpoint.peer),
            },
            origin: self.id,
            completion,
        })
    }
}

fn reset(host: &mut Host, endpoint: Endpoint) {
    if let Err(err) = host.disconnect_now(endpoint.peer) {
        debug!(host = %endpoint.host, peer = %endpoint.peer, error = %err, "peer already gone");
    }
    host.flush();
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if matches!(self.side, Side::Client) && self.is_live() {
            self.force_teardown();
        }
    }
}

/// A connection to a remote endpoint. Cheap to clone; clones share state.
///
/// Client connections are torn down when the last clone is dropped.
/// Server-side connections belong to their [`Server`].
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    /// Start connecting to a server.
    ///
    /// Returns immediately with status [`Status::WaitingToConnect`]. Messages
    /// sent before the handshake completes are held by the transport. A
    /// bandwidth of 0 means unlimited.
    pub fn connect_to_server(
        runtime: &NetworkRuntime,
        address: &Address,
        num_channels: usize,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> Result<Self> {
        let shared = runtime.shared();
        shared.ensure_running()?;

        let mut config = shared.config().host.clone();
        config.peer_limit = 1;
        config.channel_limit = num_channels;
        config.incoming_bandwidth = incoming_bandwidth;
        config.outgoing_bandwidth = outgoing_bandwidth;

        let mut host = Host::bind(None, config)?;
        let peer = host.connect(address.socket_addr(), num_channels)?;
        let host = shared.lock_hosts().insert(host);

        let inner = Arc::new(ConnectionInner::new(
            Arc::clone(shared),
            Side::Client,
            Status::WaitingToConnect,
            Endpoint { host, peer },
            *address,
            num_channels,
        ));
        shared.register_client(&inner)?;

        info!(connection = inner.id, %address, num_channels, "connecting to server");
        Ok(Self { inner })
    }

    /// Queue a message. Never blocks on the network.
    ///
    /// A closed connection drops the message with a warning and returns `Ok`.
    /// An out-of-range channel is an error.
    pub fn send(&self, msg_type: u32, payload: impl Into<Bytes>, channel: usize) -> Result<()> {
        let channel = self.inner.checked_channel(channel)?;
        self.inner
            .enqueue(msg_type, Bytes::new(), payload.into(), channel, None)
    }

    /// Like [`Connection::send`], with application bytes appended to the header
    /// packet.
    pub fn send_with_header(
        &self,
        msg_type: u32,
        header: &[u8],
        payload: impl Into<Bytes>,
        channel: usize,
    ) -> Result<()> {
        let channel = self.inner.checked_channel(channel)?;
        self.inner.enqueue(
            msg_type,
            Bytes::copy_from_slice(header),
            payload.into(),
            channel,
            None,
        )
    }

    /// Queue a message and get a ticket that completes once the payload has
    /// been handed to the transport and flushed, or discarded. The payload
    /// comes back through [`Connection::completed_sends`].
    pub fn send_tracked(
        &self,
        msg_type: u32,
        payload: impl Into<Bytes>,
        channel: usize,
    ) -> Result<CompletionTicket> {
        self.send_tracked_with_header(msg_type, &[], payload, channel)
    }

    /// [`Connection::send_tracked`] with application bytes appended to the
    /// header packet. The receipt carries the payload only.
    pub fn send_tracked_with_header(
        &self,
        msg_type: u32,
        header: &[u8],
        payload: impl Into<Bytes>,
        channel: usize,
    ) -> Result<CompletionTicket> {
        let channel = self.inner.checked_channel(channel)?;
        let payload = payload.into();
        let completion = self.inner.completions.issue(channel, payload.clone());
        let ticket = completion.ticket();
        self.inner.enqueue(
            msg_type,
            Bytes::copy_from_slice(header),
            payload,
            channel,
            Some(completion),
        )?;
        Ok(ticket)
    }

    /// Receipts for tracked sends completed since the last call.
    pub fn completed_sends(&self) -> Vec<SendReceipt> {
        self.inner.completions.drain()
    }

    /// Cursor over messages received on `channel`.
    pub fn incoming_message_iterator(&self, channel: usize) -> Result<MessageIterator> {
        let channel = self.inner.checked_channel(channel)?;
        self.inner.promote();
        Ok(MessageIterator::new(self.inner.inbound_queue(channel)))
    }

    /// Channels that have received at least one packet or been asked for.
    pub fn incoming_channels(&self) -> Vec<Channel> {
        self.inner.inbound.lock().keys().copied().collect()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> Status {
        self.inner.status()
    }

    /// Close the connection. Idempotent.
    ///
    /// With `wait_for_other_side`, queued sends are flushed, the transport is
    /// asked to close gracefully and the call waits up to the configured
    /// disconnect timeout for confirmation before forcing teardown. Without
    /// it, teardown is immediate.
    pub fn disconnect(&self, wait_for_other_side: bool) {
        let inner = &self.inner;
        if !inner.begin_disconnect() {
            return;
        }
        if !wait_for_other_side {
            inner.force_teardown();
            return;
        }

        inner.shared.pipeline.flush_origin(inner.id);
        let requested = inner.endpoint().is_some_and(|endpoint| {
            let mut table = inner.shared.lock_hosts();
            let Some(host) = table.get_mut(endpoint.host) else {
                return false;
            };
            let requested = host.disconnect(endpoint.peer).is_ok();
            host.flush();
            requested
        });

        if requested {
            let deadline = Instant::now() + inner.shared.config().disconnect_timeout;
            while inner.is_live() && Instant::now() < deadline {
                self.pump();
            }
            if inner.is_live() {
                debug!(connection = inner.id, "graceful disconnect timed out");
            }
        }
        inner.force_teardown();
    }

    /// Block until the handshake completes (`true`) or fails or `timeout`
    /// passes (`false`).
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.status() {
                Status::JustConnected | Status::Connected => return true,
                Status::WaitingToDisconnect | Status::Disconnected => return false,
                Status::WaitingToConnect => {}
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.pump();
        }
    }

    /// Give the network a chance to move: service it directly without
    /// background threads, otherwise sleep one communication interval.
    fn pump(&self) {
        let shared = &self.inner.shared;
        if shared.is_threaded() {
            thread::sleep(shared.communication_interval().max(MIN_PAUSE));
        } else if shared.ensure_running().is_ok() {
            shared.service();
            thread::sleep(shared.communication_interval().max(MIN_PAUSE));
        } else {
            thread::sleep(MIN_PAUSE);
        }
    }

    /// Smoothed one-way latency in seconds. 0 before the first sample.
    pub fn latency(&self) -> f64 {
        self.inner.latency.lock().tracker.latency()
    }

    /// Latency variance in seconds squared. Infinite before the first sample.
    pub fn latency_variance(&self) -> f64 {
        self.inner.latency.lock().tracker.latency_variance()
    }

    /// Remote address: the server for a client, the client for a server-side
    /// connection.
    pub fn address(&self) -> Address {
        self.inner.address
    }

    /// Runtime-unique id, also used in log fields.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Usable channels. A client reports the requested count until the
    /// handshake completes and the negotiated count afterwards.
    pub fn channel_count(&self) -> usize {
        self.inner.channel_count()
    }

    /// Whether a [`Server`] accepted this connection.
    pub fn is_server_side(&self) -> bool {
        matches!(self.inner.side, Side::Server(_))
    }

    /// The server that accepted this connection, while it is still alive.
    pub fn server(&self) -> Option<Server> {
        match &self.inner.side {
            Side::Server(server) => server.upgrade().map(Server::from_inner),
            Side::Client => None,
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("status", &self.status())
            .field("channels", &self.inner.channel_count())
            .finish()
    }
}
