//! Connections, servers and the network runtime.
//!
//! This is the layer applications use. A [`NetworkRuntime`] owns every
//! transport host behind one lock, a receiver loop that polls them, and a
//! per-channel send pipeline. [`Server`]s accept [`Connection`]s; connections
//! send typed messages on numbered channels and read them back through
//! [`MessageIterator`]s.
//!
//! Without background threads ([`NetworkConfig::cooperative`]) nothing moves
//! until the application calls [`NetworkRuntime::service_network`].

pub mod completion;
pub mod config;
pub mod connection;
pub mod error;
mod hosts;
pub mod latency;
mod pipeline;
mod receiver;
pub mod runtime;
pub mod server;

pub use completion::{CompletionTicket, SendReceipt};
pub use config::NetworkConfig;
pub use connection::{Connection, Status};
pub use error::{NetError, Result};
pub use latency::LatencyTracker;
pub use muxnet_frame::{Channel, Message, MessageIterator, MAX_CHANNELS};
pub use muxnet_transport::Address;
pub use runtime::NetworkRuntime;
pub use server::{ConnectionIterator, Server};
