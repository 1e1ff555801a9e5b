//! The transport host: one ENet host, one UDP socket, many peers.
//!
//! A [`Host`] is not internally synchronized. Every method takes `&mut self` and
//! callers serialize access; queued packets reach the wire on [`Host::flush`] or
//! [`Host::service`].

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use bytes::Bytes;
use rusty_enet as enet;
use tracing::{debug, info, trace, warn};

use crate::config::{HostConfig, MAX_CHANNEL_COUNT};
use crate::error::{Result, TransportError};
use crate::peer::{PeerId, PeerState, RoundTrip, Slot};

/// Something that happened on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A handshake completed, in either direction.
    Connect { peer: PeerId },
    /// A packet arrived on `channel`.
    Receive {
        peer: PeerId,
        channel: u8,
        packet: Bytes,
    },
    /// The peer is gone: graceful close, remote close or handshake timeout.
    Disconnect { peer: PeerId },
}

impl Event {
    pub fn peer(&self) -> PeerId {
        match self {
            Self::Connect { peer } | Self::Receive { peer, .. } | Self::Disconnect { peer } => *peer,
        }
    }
}

/// An ENet event with the peer borrow already released.
enum Raw {
    Connect {
        slot: usize,
        addr: Option<SocketAddr>,
        channel_count: usize,
    },
    Receive {
        slot: usize,
        channel: u8,
        packet: Bytes,
    },
    Disconnect {
        slot: usize,
    },
}

/// A bound ENet host and the peers it tracks.
pub struct Host {
    enet: enet::Host<UdpSocket>,
    local_addr: SocketAddr,
    config: HostConfig,
    slots: HashMap<usize, Slot>,
    next_generation: u32,
    /// Packets handed to ENet since the last flush.
    unflushed: usize,
    /// Events produced by the host itself rather than by ENet.
    synthetic: VecDeque<Event>,
}

impl Host {
    /// Bind a host. `None` binds an ephemeral port on every interface, which
    /// is what a client wants.
    pub fn bind(addr: Option<SocketAddr>, config: HostConfig) -> Result<Self> {
        check_channel_count(config.channel_limit)?;
        let addr = addr.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        socket.set_nonblocking(true)?;

        let settings = enet::HostSettings {
            peer_limit: config.peer_limit,
            channel_limit: config.channel_limit,
            incoming_bandwidth_limit: limit(config.incoming_bandwidth),
            outgoing_bandwidth_limit: limit(config.outgoing_bandwidth),
            ..Default::default()
        };
        let enet = enet::Host::new(socket, settings)
            .map_err(|err| TransportError::Create(format!("{err:?}")))?;

        debug!(%local_addr, peer_limit = config.peer_limit, "host bound");
        Ok(Self {
            enet,
            local_addr,
            config,
            slots: HashMap::new(),
            next_generation: 0,
            unflushed: 0,
            synthetic: VecDeque::new(),
        })
    }

    /// Start a handshake. The peer is usable for sends right away; they are
    /// held until the handshake completes.
    pub fn connect(&mut self, addr: SocketAddr, channel_count: usize) -> Result<PeerId> {
        check_channel_count(channel_count)?;
        let slot = self
            .enet
            .connect(addr, channel_count, 0)
            .map_err(|_| TransportError::HostFull {
                limit: self.config.peer_limit,
            })?
            .id()
            .0;
        let id = self.track(slot, PeerState::Connecting, addr, channel_count);
        debug!(%addr, peer = %id, channel_count, "connecting");
        Ok(id)
    }

    /// Queue a reliable packet for `peer` on `channel`.
    pub fn send(&mut self, peer: PeerId, channel: u8, data: &[u8]) -> Result<()> {
        let slot = self.slot_mut(peer)?;
        if usize::from(channel) >= slot.channel_count {
            return Err(TransportError::InvalidChannel {
                channel,
                limit: slot.channel_count,
            });
        }
        match slot.state {
            PeerState::Connecting => {
                slot.held.push((channel, Bytes::copy_from_slice(data)));
                Ok(())
            }
            PeerState::Disconnecting => Err(TransportError::Disconnecting(peer)),
            PeerState::Connected => {
                send_reliable(&mut self.enet, peer, channel, data)?;
                self.unflushed += 1;
                Ok(())
            }
        }
    }

    /// Queue a reliable packet for every connected peer. Peers that refuse
    /// it are skipped.
    pub fn broadcast(&mut self, channel: u8, data: &[u8]) {
        let targets: Vec<PeerId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.state == PeerState::Connected)
            .map(|(index, slot)| PeerId {
                slot: *index,
                generation: slot.generation,
            })
            .collect();
        for peer in targets {
            if let Err(err) = self.send(peer, channel, data) {
                debug!(%peer, channel, error = %err, "broadcast skipped peer");
            }
        }
    }

    /// Put every queued packet on the wire.
    pub fn flush(&mut self) {
        self.enet.flush();
        self.unflushed = 0;
    }

    /// Next event, without blocking. Queued packets are sent and incoming
    /// datagrams processed as a side effect.
    pub fn service(&mut self) -> Result<Option<Event>> {
        self.expire_handshakes();
        if let Some(event) = self.synthetic.pop_front() {
            return Ok(Some(event));
        }

        loop {
            let raw = match self.enet.service() {
                Ok(event) => event.map(translate),
                Err(err) => return Err(TransportError::Service(format!("{err:?}"))),
            };
            let Some(raw) = raw else {
                self.unflushed = 0;
                self.sample_round_trips();
                return Ok(None);
            };
            if let Some(event) = self.accept(raw) {
                return Ok(Some(event));
            }
        }
    }

    /// Close gracefully. [`Event::Disconnect`] follows once the remote side
    /// confirms; a peer still connecting is dropped at once.
    pub fn disconnect(&mut self, peer: PeerId) -> Result<()> {
        let state = self.slot_mut(peer)?.state;
        if state == PeerState::Connecting {
            self.drop_peer(peer);
            self.synthetic.push_back(Event::Disconnect { peer });
            return Ok(());
        }
        self.flush();
        if let Some(remote) = self.enet.get_peer_mut(enet::PeerID(peer.slot)) {
            remote.disconnect(0);
        }
        if let Some(slot) = self.slots.get_mut(&peer.slot) {
            slot.state = PeerState::Disconnecting;
        }
        debug!(peer = %peer, "disconnect requested");
        Ok(())
    }

    /// Drop the peer without waiting for the remote side. No event follows.
    pub fn disconnect_now(&mut self, peer: PeerId) -> Result<()> {
        self.slot_mut(peer)?;
        self.drop_peer(peer);
        Ok(())
    }

    /// `None` until ENet reports a round trip of its own.
    pub fn round_trip(&self, peer: PeerId) -> Option<RoundTrip> {
        self.slot(peer)?.round_trip()
    }

    /// Packets not yet on the wire: handed to ENet but unflushed, plus held
    /// for handshakes in progress.
    pub fn backlog(&self) -> usize {
        self.unflushed + self.slots.values().map(|slot| slot.held.len()).sum::<usize>()
    }

    pub fn peer_address(&self, peer: PeerId) -> Option<SocketAddr> {
        self.slot(peer).map(|slot| slot.addr)
    }

    pub fn peer_state(&self, peer: PeerId) -> Option<PeerState> {
        self.slot(peer).map(|slot| slot.state)
    }

    /// Channel count requested while connecting, negotiated once connected.
    pub fn peer_channel_count(&self, peer: PeerId) -> Option<usize> {
        self.slot(peer).map(|slot| slot.channel_count)
    }

    pub fn peer_count(&self) -> usize {
        self.slots.len()
    }

    /// The bound socket address, with the real port when bound to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    fn track(&mut self, slot: usize, state: PeerState, addr: SocketAddr, channel_count: usize) -> PeerId {
        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;
        if let Some(stale) = self
            .slots
            .insert(slot, Slot::new(generation, state, addr, channel_count))
        {
            trace!(slot, generation = stale.generation, "stale peer slot replaced");
        }
        PeerId { slot, generation }
    }

    fn slot(&self, peer: PeerId) -> Option<&Slot> {
        self.slots
            .get(&peer.slot)
            .filter(|slot| slot.generation == peer.generation)
    }

    fn slot_mut(&mut self, peer: PeerId) -> Result<&mut Slot> {
        self.slots
            .get_mut(&peer.slot)
            .filter(|slot| slot.generation == peer.generation)
            .ok_or(TransportError::UnknownPeer(peer))
    }

    fn current_id(&self, slot: usize) -> Option<PeerId> {
        self.slots.get(&slot).map(|state| PeerId {
            slot,
            generation: state.generation,
        })
    }

    fn drop_peer(&mut self, peer: PeerId) {
        if let Some(remote) = self.enet.get_peer_mut(enet::PeerID(peer.slot)) {
            remote.disconnect_now(0);
        }
        self.slots.remove(&peer.slot);
    }

    fn expire_handshakes(&mut self) {
        let timeout = self.config.connect_timeout;
        let expired: Vec<PeerId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.state == PeerState::Connecting && slot.since.elapsed() >= timeout)
            .map(|(index, slot)| PeerId {
                slot: *index,
                generation: slot.generation,
            })
            .collect();
        for peer in expired {
            warn!(peer = %peer, ?timeout, "handshake timed out");
            self.drop_peer(peer);
            self.synthetic.push_back(Event::Disconnect { peer });
        }
    }

    fn sample_round_trips(&mut self) {
        for (index, slot) in &mut self.slots {
            if slot.state != PeerState::Connected {
                continue;
            }
            if let Some(remote) = self.enet.get_peer(enet::PeerID(*index)) {
                slot.observe(remote.round_trip_time());
            }
        }
    }

    /// Fold an ENet event into the slot table. Events for peers this host no
    /// longer tracks are dropped.
    fn accept(&mut self, raw: Raw) -> Option<Event> {
        match raw {
            Raw::Connect {
                slot,
                addr,
                channel_count,
            } => {
                let outgoing = self
                    .slots
                    .get(&slot)
                    .is_some_and(|state| state.state == PeerState::Connecting);
                let peer = if outgoing {
                    self.complete_handshake(slot, channel_count)?
                } else {
                    let addr = addr.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
                    let peer = self.track(slot, PeerState::Connected, addr, channel_count);
                    info!(%addr, %peer, channel_count, "peer connected");
                    peer
                };
                Some(Event::Connect { peer })
            }
            Raw::Receive {
                slot,
                channel,
                packet,
            } => {
                let Some(peer) = self.current_id(slot) else {
                    trace!(slot, channel, "packet from untracked peer dropped");
                    return None;
                };
                Some(Event::Receive {
                    peer,
                    channel,
                    packet,
                })
            }
            Raw::Disconnect { slot } => {
                let peer = self.current_id(slot)?;
                self.slots.remove(&slot);
                debug!(%peer, "peer disconnected");
                Some(Event::Disconnect { peer })
            }
        }
    }

    /// The remote side confirmed our handshake. Held sends go out on the
    /// negotiated channels; sends on channels the remote side refused are
    /// dropped rather than handed to ENet.
    fn complete_handshake(&mut self, slot: usize, negotiated: usize) -> Option<PeerId> {
        let peer = self.current_id(slot)?;
        let state = self.slots.get_mut(&slot)?;
        state.state = PeerState::Connected;
        if negotiated < state.channel_count {
            info!(%peer, requested = state.channel_count, negotiated, "channel count reduced by remote host");
        }
        state.channel_count = negotiated;
        let held = std::mem::take(&mut state.held);

        for (channel, data) in held {
            if usize::from(channel) >= negotiated {
                warn!(%peer, channel, negotiated, "send on unnegotiated channel dropped");
                continue;
            }
            match send_reliable(&mut self.enet, peer, channel, &data) {
                Ok(()) => self.unflushed += 1,
                Err(err) => warn!(%peer, channel, error = %err, "held send refused"),
            }
        }
        info!(%peer, channels = negotiated, "connected");
        Some(peer)
    }
}

fn translate(event: enet::Event<'_, UdpSocket>) -> Raw {
    match event {
        enet::Event::Connect { peer, .. } => Raw::Connect {
            slot: peer.id().0,
            addr: peer.address(),
            channel_count: peer.channel_count(),
        },
        enet::Event::Receive {
            peer,
            channel_id,
            packet,
        } => Raw::Receive {
            slot: peer.id().0,
            channel: channel_id,
            packet: Bytes::copy_from_slice(packet.data()),
        },
        enet::Event::Disconnect { peer, .. } => Raw::Disconnect { slot: peer.id().0 },
    }
}

fn send_reliable(
    enet: &mut enet::Host<UdpSocket>,
    peer: PeerId,
    channel: u8,
    data: &[u8],
) -> Result<()> {
    let remote = enet
        .get_peer_mut(enet::PeerID(peer.slot))
        .ok_or(TransportError::UnknownPeer(peer))?;
    remote
        .send(channel, &enet::Packet::reliable(data))
        .map_err(|err| TransportError::Refused {
            peer,
            reason: format!("{err:?}"),
        })
}

fn check_channel_count(count: usize) -> Result<()> {
    if count == 0 || count > MAX_CHANNEL_COUNT {
        return Err(TransportError::InvalidChannelCount(count));
    }
    Ok(())
}

fn limit(bytes_per_second: u32) -> Option<u32> {
    (bytes_per_second > 0).then_some(bytes_per_second)
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().expect("loopback address should parse")
    }

    fn drain(host: &mut Host, into: &mut Vec<Event>) {
        while let Some(event) = host.service().expect("service should succeed") {
            into.push(event);
        }
    }

    struct Pair {
        server: Host,
        client: Host,
        server_events: Vec<Event>,
        client_events: Vec<Event>,
        to_server: PeerId,
    }

    impl Pair {
        fn start(server_config: HostConfig, requested: usize) -> Self {
            let server = Host::bind(Some(localhost()), server_config).expect("server should bind");
            let mut client = Host::bind(None, HostConfig::default()).expect("client should bind");
            let to_server = client
                .connect(server_addr(&server), requested)
                .expect("connect should start");
            Self {
                server,
                client,
                server_events: Vec::new(),
                client_events: Vec::new(),
                to_server,
            }
        }

        fn connect(config: HostConfig) -> Self {
            let mut pair = Self::start(config, 2);
            pair.pump_until(Pair::connected);
            pair
        }

        fn connected(&self) -> bool {
            self.client_events.contains(&Event::Connect {
                peer: self.to_server,
            }) && self
                .server_events
                .iter()
                .any(|e| matches!(e, Event::Connect { .. }))
        }

        fn to_client(&self) -> PeerId {
            self.server_events
                .iter()
                .find_map(|e| match e {
                    Event::Connect { peer } => Some(*peer),
                    _ => None,
                })
                .expect("server should have accepted a peer")
        }

        fn pump_until(&mut self, mut done: impl FnMut(&Pair) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done(self) {
                assert!(Instant::now() < deadline, "hosts did not reach expected state");
                drain(&mut self.server, &mut self.server_events);
                drain(&mut self.client, &mut self.client_events);
                thread::sleep(Duration::from_millis(1));
            }
        }

        fn server_received(&self) -> Vec<(u8, Bytes)> {
            self.server_events
                .iter()
                .filter_map(|e| match e {
                    Event::Receive {
                        channel, packet, ..
                    } => Some((*channel, packet.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    fn server_addr(server: &Host) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, server.local_addr().port()))
    }

    #[test]
    fn handshake_connects_both_sides() {
        let pair = Pair::connect(HostConfig::default());
        assert_eq!(
            pair.client.peer_state(pair.to_server),
            Some(PeerState::Connected)
        );
        assert_eq!(pair.client.peer_channel_count(pair.to_server), Some(2));
        assert_eq!(pair.server.peer_channel_count(pair.to_client()), Some(2));
        assert_eq!(pair.server.peer_count(), 1);
    }

    #[test]
    fn reliable_packets_arrive_in_order_per_channel() {
        let mut pair = Pair::connect(HostConfig::default());
        for i in 0..20u8 {
            pair.client
                .send(pair.to_server, 1, &[i])
                .expect("send should queue");
        }
        pair.client
            .send(pair.to_server, 0, b"other")
            .expect("send should queue");
        assert!(pair.client.backlog() > 0);
        pair.client.flush();
        assert_eq!(pair.client.backlog(), 0);

        pair.pump_until(|p| p.server_received().len() >= 21);

        let on_one: Vec<u8> = pair
            .server_received()
            .into_iter()
            .filter(|(channel, _)| *channel == 1)
            .map(|(_, packet)| packet[0])
            .collect();
        assert_eq!(on_one, (0..20).collect::<Vec<u8>>());
    }

    #[test]
    fn large_packet_arrives_whole() {
        let mut pair = Pair::connect(HostConfig::default());
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i * 7) as u8).collect();
        pair.client
            .send(pair.to_server, 0, &payload)
            .expect("send should queue");

        pair.pump_until(|p| !p.server_received().is_empty());
        let received = pair.server_received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1.as_ref(), payload.as_slice());
    }

    #[test]
    fn sends_before_handshake_are_held_then_delivered() {
        let mut pair = Pair::start(HostConfig::default(), 2);
        pair.client
            .send(pair.to_server, 1, b"early")
            .expect("held send should queue");
        assert_eq!(pair.client.backlog(), 1);

        pair.pump_until(|p| !p.server_received().is_empty());
        assert_eq!(pair.server_received()[0], (1, Bytes::from_static(b"early")));
    }

    #[test]
    fn held_send_on_unnegotiated_channel_is_dropped() {
        let server_config = HostConfig {
            channel_limit: 1,
            ..HostConfig::default()
        };
        let mut pair = Pair::start(server_config, 2);
        pair.client
            .send(pair.to_server, 1, b"refused")
            .expect("held send should queue");
        pair.client
            .send(pair.to_server, 0, b"kept")
            .expect("held send should queue");

        pair.pump_until(|p| p.connected() && !p.server_received().is_empty());
        assert_eq!(pair.client.peer_channel_count(pair.to_server), Some(1));
        assert_eq!(pair.server_received(), vec![(0, Bytes::from_static(b"kept"))]);
        assert!(matches!(
            pair.client.send(pair.to_server, 1, b"late"),
            Err(TransportError::InvalidChannel { channel: 1, limit: 1 })
        ));

        let settle = Instant::now() + Duration::from_millis(300);
        pair.pump_until(|_| Instant::now() >= settle);
        assert_eq!(
            pair.client.peer_state(pair.to_server),
            Some(PeerState::Connected)
        );
        assert!(!pair
            .client_events
            .contains(&Event::Disconnect { peer: pair.to_server }));
    }

    #[test]
    fn graceful_disconnect_notifies_both_sides() {
        let mut pair = Pair::connect(HostConfig::default());
        let to_client = pair.to_client();
        pair.client
            .send(pair.to_server, 0, b"last words")
            .expect("send should queue");
        pair.client.flush();
        pair.pump_until(|p| !p.server_received().is_empty());
        pair.client
            .disconnect(pair.to_server)
            .expect("disconnect should be accepted");
        assert!(matches!(
            pair.client.send(pair.to_server, 0, b"too late"),
            Err(TransportError::Disconnecting(_))
        ));

        pair.pump_until(|p| {
            p.client_events.contains(&Event::Disconnect { peer: p.to_server })
                && p.server_events.contains(&Event::Disconnect { peer: to_client })
        });
        assert_eq!(pair.client.peer_count(), 0);
        assert_eq!(pair.server.peer_count(), 0);
    }

    #[test]
    fn unanswered_handshake_times_out() {
        let silent = UdpSocket::bind(localhost()).expect("silent socket should bind");
        let config = HostConfig {
            connect_timeout: Duration::from_millis(100),
            ..HostConfig::default()
        };
        let mut client = Host::bind(None, config).expect("client should bind");
        let peer = client
            .connect(silent.local_addr().expect("silent socket should have an address"), 1)
            .expect("connect should start");
        client.send(peer, 0, b"never").expect("held send should queue");

        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !events.contains(&Event::Disconnect { peer }) {
            assert!(Instant::now() < deadline, "handshake should time out");
            drain(&mut client, &mut events);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(client.peer_count(), 0);
        assert_eq!(client.backlog(), 0);
    }

    #[test]
    fn stale_handles_stay_dead() {
        let mut host = Host::bind(None, HostConfig::default()).expect("host should bind");
        let target: SocketAddr = "127.0.0.1:9".parse().expect("address should parse");
        let first = host.connect(target, 1).expect("connect should start");
        host.disconnect_now(first).expect("first peer should exist");

        let second = host.connect(target, 1).expect("connect should start");
        assert_ne!(first, second);
        assert!(matches!(
            host.send(first, 0, b"x"),
            Err(TransportError::UnknownPeer(peer)) if peer == first
        ));
        assert!(host.send(second, 0, b"x").is_ok());
    }

    #[test]
    fn rejects_bad_arguments() {
        let mut host = Host::bind(None, HostConfig::default()).expect("host should bind");
        let target: SocketAddr = "127.0.0.1:9".parse().expect("address should parse");
        assert!(matches!(
            host.connect(target, 0),
            Err(TransportError::InvalidChannelCount(0))
        ));
        assert!(matches!(
            host.connect(target, 256),
            Err(TransportError::InvalidChannelCount(256))
        ));

        let peer = host.connect(target, 1).expect("connect should start");
        assert!(matches!(
            host.send(peer, 1, b"x"),
            Err(TransportError::InvalidChannel { channel: 1, limit: 1 })
        ));
        host.disconnect(peer).expect("disconnect should succeed");
        assert_eq!(host.peer_count(), 0);
        assert_eq!(
            host.service().expect("service should succeed"),
            Some(Event::Disconnect { peer })
        );
    }

    #[test]
    fn bind_failure_reports_address() {
        let first = Host::bind(Some(localhost()), HostConfig::default()).expect("host should bind");
        let taken = first.local_addr();
        match Host::bind(Some(taken), HostConfig::default()) {
            Err(TransportError::Bind { addr, .. }) => assert_eq!(addr, taken),
            other => panic!("expected bind error, got {:?}", other.map(|h| h.local_addr())),
        }
    }
}
