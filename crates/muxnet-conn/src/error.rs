/// Errors that can occur in connection operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] muxnet_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] muxnet_frame::FrameError),

    /// The channel is outside the range the connection was opened with.
    #[error("channel {channel} not available (connection has {limit} channels)")]
    InvalidChannel { channel: usize, limit: usize },

    /// The server was stopped.
    #[error("server stopped")]
    ServerStopped,

    /// The runtime was shut down.
    #[error("network runtime shut down")]
    RuntimeShutdown,

    /// A worker thread could not be started.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    /// A configuration value cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// JSON configuration error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;
