//! UDP transport for muxnet.
//!
//! A [`Host`] wraps one ENet host: one UDP socket, any number of peers, packets
//! tagged with a channel and delivered reliably and in order per channel. The
//! protocol itself is `rusty_enet`'s; this crate adds stable peer handles,
//! holding of sends issued before a handshake completes, and round-trip sampling.
//!
//! The host is a plain single-threaded value: the connection layer serializes
//! every call through its own lock.

pub mod address;
pub mod config;
pub mod error;
pub mod host;
pub mod peer;

pub use address::Address;
pub use config::{HostConfig, MAX_CHANNEL_COUNT};
pub use error::{Result, TransportError};
pub use host::{Event, Host};
pub use peer::{PeerId, PeerState, RoundTrip};
