#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use muxnet::{Address, Connection, Message, NetworkRuntime, Server};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn any_port() -> Address {
    Address::new("127.0.0.1", 0).expect("loopback should parse")
}

/// Poll `done` until it holds or `timeout` passes. `runtime` is pumped on each
/// round when given, for runtimes without background threads.
pub fn wait_until(
    runtime: Option<&NetworkRuntime>,
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(runtime) = runtime {
            runtime.service_network();
        }
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn accept(runtime: Option<&NetworkRuntime>, server: &Server) -> Connection {
    let mut accepted = None;
    let found = wait_until(runtime, TIMEOUT, || {
        accepted = server
            .new_connection_iterator()
            .expect("server should be running")
            .next();
        accepted.is_some()
    });
    assert!(found, "server should accept a connection");
    accepted.expect("connection should be accepted")
}

pub fn connect(runtime: &NetworkRuntime, server: &Server, channels: usize) -> Connection {
    let client = Connection::connect_to_server(runtime, &server.address(), channels, 0, 0)
        .expect("connect should start");
    let pump = (!runtime.config().threaded).then_some(runtime);
    assert!(
        wait_until(pump, TIMEOUT, || client.status() != muxnet::Status::WaitingToConnect),
        "handshake should finish"
    );
    client
}

/// Read `count` messages from `channel`, or whatever arrived before `timeout`.
pub fn receive(
    runtime: Option<&NetworkRuntime>,
    conn: &Connection,
    channel: usize,
    count: usize,
    timeout: Duration,
) -> Vec<Message> {
    let mut messages = conn
        .incoming_message_iterator(channel)
        .expect("channel should be valid");
    let mut received = Vec::new();
    wait_until(runtime, timeout, || {
        received.extend(messages.by_ref());
        if received.len() < count && runtime.is_none() {
            messages.wait(Duration::from_millis(5));
        }
        received.len() >= count
    });
    received
}

/// UDP relay that holds every datagram for a fixed delay in each direction.
/// The first non-target sender becomes the client side.
pub struct DelayRelay {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DelayRelay {
    pub fn start(target: SocketAddr, delay: Duration) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("relay should bind");
        socket
            .set_read_timeout(Some(Duration::from_millis(1)))
            .expect("read timeout should apply");
        let addr = socket.local_addr().expect("relay should have an address");
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let mut client: Option<SocketAddr> = None;
            let mut held: VecDeque<(Instant, SocketAddr, Vec<u8>)> = VecDeque::new();
            let mut buf = vec![0u8; 64 * 1024];
            while !flag.load(Ordering::Acquire) {
                if let Ok((len, from)) = socket.recv_from(&mut buf) {
                    let to = if from == target {
                        client
                    } else {
                        client = Some(from);
                        Some(target)
                    };
                    if let Some(to) = to {
                        held.push_back((Instant::now() + delay, to, buf[..len].to_vec()));
                    }
                }
                while held.front().is_some_and(|(due, _, _)| *due <= Instant::now()) {
                    if let Some((_, to, data)) = held.pop_front() {
                        let _ = socket.send_to(&data, to);
                    }
                }
            }
        });

        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    pub fn address(&self) -> Address {
        Address::from_socket_addr(self.addr).expect("relay address should be IPv4")
    }
}

impl Drop for DelayRelay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
