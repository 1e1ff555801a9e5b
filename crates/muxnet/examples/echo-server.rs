//! Echo server: accepts clients and sends every message back on the channel it
//! arrived on, until Ctrl-C.
//!
//! Run with:
//!   cargo run -p muxnet --example echo-server --features logging -- 127.0.0.1 9000
//!
//! `MUXNET_LOG_LEVEL=debug` shows transport activity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use muxnet::logging::init_logging_from_env;
use muxnet::{Address, NetworkConfig, NetworkRuntime, Server};

const CHANNELS: usize = 4;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().map(|p| p.parse()).transpose()?.unwrap_or(9000);

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))?;
    }

    let runtime = NetworkRuntime::init(NetworkConfig::default())?;
    let server = Server::create(&runtime, &Address::new(&host, port)?, 32, CHANNELS, 0, 0)?;
    tracing::info!(address = %server.address(), "echo server ready");

    let mut clients = Vec::new();
    while running.load(Ordering::SeqCst) {
        clients.extend(server.new_connection_iterator()?);
        clients.retain(|c| c.status() != muxnet::Status::Disconnected);

        for client in &clients {
            for channel in 0..client.channel_count() {
                for message in client.incoming_message_iterator(channel)? {
                    tracing::info!(
                        client = %client.address(),
                        channel,
                        msg_type = message.msg_type,
                        bytes = message.payload.len(),
                        "echo"
                    );
                    client.send(message.msg_type, message.payload, channel)?;
                }
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    server.stop();
    runtime.shutdown();
    Ok(())
}
