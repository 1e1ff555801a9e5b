//! Every transport host of a runtime, behind one lock.
//!
//! A transport host is not safe for concurrent use, so the receiver loop and
//! every sender worker go through `Mutex<HostTable>` for each call. Hosts are referred
//! to by [`HostId`]; ids are never reused, so a handle outliving its host is
//! detected instead of reaching a different host.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use muxnet_transport::{Event, Host, PeerId, RoundTrip};
use tracing::warn;

/// Upper bound on events drained from one host per poll.
const MAX_EVENTS_PER_POLL: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostId(u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host#{}", self.0)
    }
}

/// A peer of a particular host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: HostId,
    pub peer: PeerId,
}

/// Peer details captured while the transport lock was held.
#[derive(Debug, Clone, Copy)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    /// Requested while connecting, negotiated afterwards.
    pub channel_count: usize,
}

/// Result of draining one host.
#[derive(Debug, Default)]
pub struct Polled {
    pub events: Vec<Event>,
    pub peers: HashMap<PeerId, PeerSnapshot>,
}

#[derive(Default)]
pub struct HostTable {
    hosts: HashMap<HostId, Host>,
    next_id: u64,
}

impl HostTable {
    pub fn insert(&mut self, host: Host) -> HostId {
        self.next_id += 1;
        let id = HostId(self.next_id);
        self.hosts.insert(id, host);
        id
    }

    /// Destroy a host. Packets it has not flushed are lost.
    pub fn remove(&mut self, id: HostId) -> Option<Host> {
        self.hosts.remove(&id)
    }

    pub fn get_mut(&mut self, id: HostId) -> Option<&mut Host> {
        self.hosts.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn round_trip(&self, endpoint: Endpoint) -> Option<RoundTrip> {
        self.hosts.get(&endpoint.host)?.round_trip(endpoint.peer)
    }

    /// Transport backlog summed over every host.
    pub fn backlog(&self) -> usize {
        self.hosts.values().map(Host::backlog).sum()
    }

    pub fn clear(&mut self) {
        self.hosts.clear();
    }

    /// Drain pending events of one host without blocking. Returns `None` when
    /// the host no longer exists.
    pub fn poll(&mut self, id: HostId) -> Option<Polled> {
        let host = self.hosts.get_mut(&id)?;
        let mut polled = Polled::default();

        while polled.events.len() < MAX_EVENTS_PER_POLL {
            match host.service() {
                Ok(Some(event)) => polled.events.push(event),
                Ok(None) => break,
                Err(err) => {
                    warn!(host = %id, error = %err, "host service failed");
                    break;
                }
            }
        }

        for event in &polled.events {
            let peer = event.peer();
            if polled.peers.contains_key(&peer) {
                continue;
            }
            if let (Some(addr), Some(channel_count)) =
                (host.peer_address(peer), host.peer_channel_count(peer))
            {
                polled.peers.insert(
                    peer,
                    PeerSnapshot {
                        addr,
                        channel_count,
                    },
                );
            }
        }
        Some(polled)
    }
}
