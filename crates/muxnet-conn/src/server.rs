//! Servers: a listening host plus the connections it has accepted.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use muxnet_frame::validate_channel;
use muxnet_transport::{Address, Event, Host, PeerId, TransportError, MAX_CHANNEL_COUNT};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, ConnectionInner, Side, Status};
use crate::error::{NetError, Result};
use crate::hosts::{Endpoint, HostId};
use crate::pipeline::{Destination, PendingSend, Target};
use crate::runtime::{NetworkRuntime, Shared};

pub(crate) struct ServerInner {
    id: u64,
    shared: Arc<Shared>,
    host: HostId,
    address: Address,
    channel_count: usize,
    stopped: AtomicBool,
    connections: Mutex<HashMap<PeerId, Connection>>,
    new_connections: Arc<Mutex<VecDeque<Connection>>>,
}

impl ServerInner {
    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(NetError::ServerStopped);
        }
        Ok(())
    }

    /// Drain this server's host. Called by the receiver loop, or by
    /// `service_network` without background threads.
    pub(crate) fn service_host(self: &Arc<Self>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let Some(polled) = self.shared.lock_hosts().poll(self.host) else {
            return;
        };

        for event in polled.events {
            match event {
                Event::Connect { peer } => {
                    let Some(snapshot) = polled.peers.get(&peer) else {
                        trace!(server = %self.address, %peer, "peer left before it was accepted");
                        continue;
                    };
                    let Some(address) = Address::from_socket_addr(snapshot.addr) else {
                        warn!(server = %self.address, addr = %snapshot.addr, "non-IPv4 peer ignored");
                        continue;
                    };
                    if self.accept(peer, address, snapshot.channel_count).is_none() {
                        return;
                    }
                }
                Event::Receive {
                    peer,
                    channel,
                    packet,
                } => {
                    let connection = self.connections.lock().get(&peer).cloned();
                    match connection {
                        Some(connection) => connection.inner.deliver(channel, packet),
                        None => trace!(server = %self.address, %peer, "packet from unknown peer dropped"),
                    }
                }
                Event::Disconnect { peer } => {
                    let connection = self.connections.lock().remove(&peer);
                    if let Some(connection) = connection {
                        connection.inner.mark_disconnected();
                    }
                }
            }
        }

        self.refresh_latencies();
    }

    /// Track a peer whose handshake completed. Returns `None`, and tracks
    /// nothing, once the server is stopped.
    fn accept(
        self: &Arc<Self>,
        peer: PeerId,
        address: Address,
        channel_count: usize,
    ) -> Option<Connection> {
        let connection = Connection::from_inner(Arc::new(ConnectionInner::new(
            Arc::clone(&self.shared),
            Side::Server(Arc::downgrade(self)),
            Status::JustConnected,
            Endpoint {
                host: self.host,
                peer,
            },
            address,
            channel_count,
        )));

        {
            let mut connections = self.connections.lock();
            // `stop` drains under this lock after raising the flag.
            if self.stopped.load(Ordering::Acquire) {
                drop(connections);
                debug!(server = %self.address, %peer, "connect after stop ignored");
                connection.inner.mark_disconnected();
                return None;
            }
            connections.insert(peer, connection.clone());
            self.new_connections.lock().push_back(connection.clone());
        }
        info!(
            server = %self.address,
            connection = connection.id(),
            client = %address,
            "client connected"
        );
        Some(connection)
    }

    fn refresh_latencies(&self) {
        let connections: Vec<(PeerId, Connection)> = self.connections.lock()
            .iter()
            .map(|(peer, connection)| (*peer, connection.clone()))
            .collect();
        if connections.is_empty() {
            return;
        }
        let round_trips: Vec<_> = {
            let table = self.shared.lock_hosts();
            connections
                .iter()
                .map(|(peer, _)| {
                    table.round_trip(Endpoint {
                        host: self.host,
                        peer: *peer,
                    })
                })
                .collect()
        };
        for ((_, connection), round_trip) in connections.iter().zip(round_trips) {
            connection.inner.refresh_latency(round_trip);
        }
    }

    /// Drop a connection torn down on its own.
    pub(crate) fn forget(&self, peer: PeerId) {
        let connection = self.connections.lock().remove(&peer);
        if connection.is_some() {
            trace!(server = %self.address, %peer, "connection removed");
        }
    }

    /// Force-disconnect every connection, flush, destroy the host and leave the
    /// runtime. Idempotent.
    pub(crate) fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections: Vec<(PeerId, Connection)> = self.connections.lock().drain().collect();
        self.new_connections.lock().clear();

        for (_, connection) in &connections {
            self.shared.pipeline.flush_origin(connection.id());
        }
        self.shared.pipeline.flush_origin(self.id);

        {
            let mut table = self.shared.lock_hosts();
            if let Some(mut host) = table.remove(self.host) {
                for (peer, _) in &connections {
                    if let Err(err) = host.disconnect_now(*peer) {
                        debug!(server = %self.address, %peer, error = %err, "peer already gone");
                    }
                }
                host.flush();
            }
        }

        for (_, connection) in &connections {
            connection.inner.mark_disconnected();
        }
        self.shared.unregister_server(self);
        info!(server = %self.address, connections = connections.len(), "server stopped");
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A listening endpoint that accepts client connections. Cheap to clone.
///
/// The server stops when [`Server::stop`] is called, when the runtime shuts
/// down, or when the last clone is dropped. Afterwards every operation returns
/// [`NetError::ServerStopped`].
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub(crate) fn from_inner(inner: Arc<ServerInner>) -> Self {
        Self { inner }
    }

    /// Bind `address` and start accepting up to `max_clients` clients with up
    /// to `num_channels` channels each. A bandwidth of 0 means unlimited.
    pub fn create(
        runtime: &NetworkRuntime,
        address: &Address,
        max_clients: usize,
        num_channels: usize,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> Result<Self> {
        let shared = runtime.shared();
        shared.ensure_running()?;
        if num_channels == 0 || num_channels > MAX_CHANNEL_COUNT {
            return Err(TransportError::InvalidChannelCount(num_channels).into());
        }

        let mut config = shared.config().host.clone();
        config.peer_limit = max_clients;
        config.channel_limit = num_channels;
        config.incoming_bandwidth = incoming_bandwidth;
        config.outgoing_bandwidth = outgoing_bandwidth;

        let host = Host::bind(Some(address.socket_addr()), config)?;
        let bound = Address::from_socket_addr(host.local_addr()).unwrap_or(*address);
        let host = shared.lock_hosts().insert(host);

        let inner = Arc::new(ServerInner {
            id: shared.next_id(),
            shared: Arc::clone(shared),
            host,
            address: bound,
            channel_count: num_channels,
            stopped: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
            new_connections: Arc::new(Mutex::new(VecDeque::new())),
        });
        shared.register_server(&inner)?;

        info!(address = %bound, max_clients, num_channels, "server listening");
        Ok(Self { inner })
    }

    /// Cursor over connections accepted since the last drain. Each accepted
    /// connection is yielded once.
    pub fn new_connection_iterator(&self) -> Result<ConnectionIterator> {
        self.inner.ensure_running()?;
        Ok(ConnectionIterator {
            queue: Arc::clone(&self.inner.new_connections),
        })
    }

    /// Every connection currently tracked by the server.
    pub fn connections(&self) -> Result<Vec<Connection>> {
        self.inner.ensure_running()?;
        Ok(self.inner.connections.lock().values().cloned().collect())
    }

    /// Connections currently tracked. Unlike [`Server::connections`] this
    /// also answers after the server stopped.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Queue a message for every connected client.
    pub fn broadcast(&self, msg_type: u32, payload: impl Into<Bytes>, channel: usize) -> Result<()> {
        self.inner.ensure_running()?;
        let limit = self.inner.channel_count;
        let channel = validate_channel(channel, limit)
            .map_err(|_| NetError::InvalidChannel { channel, limit })?;
        self.inner.shared.pipeline.enqueue(PendingSend {
            msg_type,
            channel,
            header: Bytes::new(),
            payload: payload.into(),
            destination: Destination {
                host: self.inner.host,
                target: Target::Broadcast,
            },
            origin: self.inner.id,
            completion: None,
        })
    }

    /// The bound address, with the real port when bound to port 0.
    pub fn address(&self) -> Address {
        self.inner.address
    }

    /// Most channels a client can negotiate.
    pub fn channel_count(&self) -> usize {
        self.inner.channel_count
    }

    /// Force-disconnect every connection and close the host. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Whether [`Server::stop`] has run, directly or through runtime shutdown.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.inner.address)
            .field("connections", &self.connection_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Cursor over newly accepted connections.
///
/// Use either as a cursor (`is_valid` / `connection` / `advance`) or as an
/// [`Iterator`]; both consume the same queue.
pub struct ConnectionIterator {
    queue: Arc<Mutex<VecDeque<Connection>>>,
}

impl ConnectionIterator {
    /// Whether a connection is waiting.
    pub fn is_valid(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// The current connection. Only meaningful while [`is_valid`](Self::is_valid).
    pub fn connection(&self) -> Option<Connection> {
        let front = self.queue.lock().front().cloned();
        debug_assert!(front.is_some(), "connection() on an exhausted iterator");
        front
    }

    /// Move past the current connection.
    pub fn advance(&mut self) {
        let popped = self.queue.lock().pop_front();
        debug_assert!(popped.is_some(), "advance() on an exhausted iterator");
    }
}

impl Iterator for ConnectionIterator {
    type Item = Connection;

    fn next(&mut self) -> Option<Connection> {
        self.queue.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use muxnet_transport::HostConfig;

    use super::*;
    use crate::config::NetworkConfig;

    fn cooperative() -> NetworkRuntime {
        NetworkRuntime::init(NetworkConfig::cooperative()).expect("runtime should start")
    }

    fn any_port() -> Address {
        Address::new("127.0.0.1", 0).expect("loopback should parse")
    }

    #[test]
    fn create_reports_bound_port() {
        let runtime = cooperative();
        let server = Server::create(&runtime, &any_port(), 4, 2, 0, 0).expect("server should bind");
        assert_ne!(server.address().port(), 0);
        assert_eq!(server.channel_count(), 2);
        assert_eq!(server.connection_count(), 0);
        assert!(!server.is_stopped());
    }

    #[test]
    fn create_rejects_bad_channel_counts() {
        let runtime = cooperative();
        assert!(Server::create(&runtime, &any_port(), 4, 0, 0, 0).is_err());
        assert!(Server::create(&runtime, &any_port(), 4, 256, 0, 0).is_err());
    }

    #[test]
    fn binding_a_taken_port_fails() {
        let runtime = cooperative();
        let first = Server::create(&runtime, &any_port(), 4, 1, 0, 0).expect("server should bind");
        let result = Server::create(&runtime, &first.address(), 4, 1, 0, 0);
        assert!(matches!(
            result,
            Err(NetError::Transport(TransportError::Bind { .. }))
        ));
    }

    #[test]
    fn operations_after_stop_fail() {
        let runtime = cooperative();
        let server = Server::create(&runtime, &any_port(), 4, 1, 0, 0).expect("server should bind");
        server.stop();
        server.stop();

        assert!(server.is_stopped());
        assert!(matches!(server.connections(), Err(NetError::ServerStopped)));
        assert!(matches!(
            server.new_connection_iterator(),
            Err(NetError::ServerStopped)
        ));
        assert!(matches!(
            server.broadcast(1, &b"x"[..], 0),
            Err(NetError::ServerStopped)
        ));
    }

    #[test]
    fn broadcast_validates_channel() {
        let runtime = cooperative();
        let server = Server::create(&runtime, &any_port(), 4, 2, 0, 0).expect("server should bind");
        assert!(matches!(
            server.broadcast(1, &b"x"[..], 2),
            Err(NetError::InvalidChannel { channel: 2, limit: 2 })
        ));
        server.broadcast(1, &b"x"[..], 1).expect("broadcast should queue");
        runtime.service_network();
        assert_eq!(runtime.network_send_backlog(), 0);
    }

    #[test]
    fn empty_iterator_is_invalid() {
        let runtime = cooperative();
        let server = Server::create(&runtime, &any_port(), 4, 1, 0, 0).expect("server should bind");
        let mut accepted = server.new_connection_iterator().expect("server is running");
        assert!(!accepted.is_valid());
        assert!(accepted.next().is_none());
    }

    fn remote_peer(server: &Server) -> PeerId {
        let mut client = Host::bind(None, HostConfig::default()).expect("client should bind");
        client
            .connect(server.address().socket_addr(), 1)
            .expect("connect should start")
    }

    #[test]
    fn accepted_peer_is_tracked_until_stop() {
        let runtime = cooperative();
        let server = Server::create(&runtime, &any_port(), 4, 2, 0, 0).expect("server should bind");
        let client = Address::new("127.0.0.1", 40_000).expect("loopback should parse");

        let connection = server
            .inner
            .accept(remote_peer(&server), client, 1)
            .expect("running server should accept");
        assert_eq!(connection.status(), Status::JustConnected);
        assert_eq!(connection.channel_count(), 1);
        assert!(connection.is_server_side());
        assert_eq!(server.connection_count(), 1);
        assert_eq!(
            server
                .new_connection_iterator()
                .expect("server is running")
                .count(),
            1
        );

        server.stop();
        assert_eq!(connection.status(), Status::Disconnected);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn connect_event_after_stop_is_not_accepted() {
        let runtime = cooperative();
        let server = Server::create(&runtime, &any_port(), 4, 1, 0, 0).expect("server should bind");
        let peer = remote_peer(&server);
        server.stop();

        let client = Address::new("127.0.0.1", 40_000).expect("loopback should parse");
        assert!(server.inner.accept(peer, client, 1).is_none());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn runtime_shutdown_stops_servers() {
        let runtime = cooperative();
        let server = Server::create(&runtime, &any_port(), 4, 1, 0, 0).expect("server should bind");
        runtime.shutdown();
        assert!(server.is_stopped());
    }
}
