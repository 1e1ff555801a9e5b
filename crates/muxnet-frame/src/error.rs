/// Errors that can occur while pairing header and data packets.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A header packet is shorter than the fixed type/channel prefix.
    #[error("header packet too short ({len} bytes, need {min})")]
    HeaderTooShort { len: usize, min: usize },

    /// A header names a different channel than the one it arrived on.
    #[error("header for channel {found} arrived on channel {expected}")]
    ChannelMismatch { expected: u8, found: u32 },

    /// The channel is outside the range of the connection.
    #[error("channel {channel} out of range (limit {limit})")]
    InvalidChannel { channel: usize, limit: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
