//! One server and one client in the same process, exchanging messages on three
//! channels at once. Ordering holds per channel; channels interleave freely.
//!
//! Run with:
//!   cargo run -p muxnet --example multi-channel --features logging

use std::time::{Duration, Instant};

use muxnet::logging::{init_logging, LogFormat, LogLevel};
use muxnet::{Address, Connection, NetworkConfig, NetworkRuntime, Server};

const CONTROL: usize = 0;
const TELEMETRY: usize = 1;
const BULK: usize = 2;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::Text, LogLevel::Info);

    let runtime = NetworkRuntime::init(NetworkConfig::default())?;
    let server = Server::create(&runtime, &Address::new("127.0.0.1", 0)?, 4, 3, 0, 0)?;
    let client = Connection::connect_to_server(&runtime, &server.address(), 3, 0, 0)?;
    if !client.wait_connected(Duration::from_secs(5)) {
        return Err("handshake did not complete".into());
    }

    client.send(1, &b"start"[..], CONTROL)?;
    for i in 0u32..5 {
        client.send(2, i.to_be_bytes().to_vec(), TELEMETRY)?;
    }
    client.send(3, vec![0xABu8; 64 * 1024], BULK)?;
    client.send(4, &b"stop"[..], CONTROL)?;

    let deadline = Instant::now() + Duration::from_secs(5);
    let accepted = loop {
        if let Some(conn) = server.new_connection_iterator()?.next() {
            break conn;
        }
        if Instant::now() > deadline {
            return Err("no connection accepted".into());
        }
        std::thread::sleep(Duration::from_millis(2));
    };

    let mut received = 0;
    while received < 8 && Instant::now() < deadline {
        for channel in [CONTROL, TELEMETRY, BULK] {
            for message in accepted.incoming_message_iterator(channel)? {
                received += 1;
                eprintln!(
                    "[{:>9}] type={} bytes={}",
                    match channel {
                        CONTROL => "control",
                        TELEMETRY => "telemetry",
                        _ => "bulk",
                    },
                    message.msg_type,
                    message.payload.len()
                );
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    eprintln!(
        "received {received} messages, latency {:.3} ms",
        client.latency() * 1000.0
    );

    client.disconnect(true);
    server.stop();
    runtime.shutdown();
    Ok(())
}
