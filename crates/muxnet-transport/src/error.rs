use std::net::SocketAddr;

use crate::peer::PeerId;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind the host socket.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to resolve a host name to an IPv4 address.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },

    /// An I/O error occurred on the host socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The host already tracks its maximum number of peers.
    #[error("host is full ({limit} peers)")]
    HostFull { limit: usize },

    /// The channel is outside the range negotiated with the peer.
    #[error("channel {channel} out of range (limit {limit})")]
    InvalidChannel { channel: u8, limit: usize },

    /// The requested channel count cannot be used.
    #[error("invalid channel count {0}")]
    InvalidChannelCount(usize),

    /// The peer handle does not refer to a live peer of this host.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The peer is closing and takes no more packets.
    #[error("peer {0} is disconnecting")]
    Disconnecting(PeerId),

    /// ENet refused to create the host.
    #[error("failed to create host: {0}")]
    Create(String),

    /// ENet refused a packet.
    #[error("packet refused for {peer}: {reason}")]
    Refused { peer: PeerId, reason: String },

    /// Servicing the host failed.
    #[error("host service failed: {0}")]
    Service(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
