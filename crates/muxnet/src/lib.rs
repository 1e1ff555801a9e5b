//! Reliable, channel-multiplexed message connections over UDP.
//!
//! muxnet turns a connectionless UDP socket into ordered, bidirectional
//! message streams. Every message carries a 32-bit type and travels on one of
//! up to 255 channels; order is kept per channel.
//!
//! # Crate Structure
//!
//! - [`transport`]: ENet host with stable peer handles and sends held until
//!   the handshake completes
//! - [`frame`]: header/data packet pairing and per-channel inbound queues
//! - [`conn`]: the network runtime, servers and connections
//!
//! The most used types are re-exported at the crate root.

/// Re-export transport types.
pub mod transport {
    pub use muxnet_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use muxnet_frame::*;
}

/// Re-export connection types.
pub mod conn {
    pub use muxnet_conn::*;
}

#[cfg(feature = "logging")]
pub mod logging;

pub use muxnet_conn::{
    Address, Channel, CompletionTicket, Connection, ConnectionIterator, Message, MessageIterator,
    NetError, NetworkConfig, NetworkRuntime, Result, SendReceipt, Server, Status, MAX_CHANNELS,
};
