//! Channel numbers.
//!
//! A channel is a small integer tag. Messages on one channel are delivered in
//! the order they were sent; different channels are independent.

use crate::error::{FrameError, Result};

pub type Channel = u8;

/// Most channels a connection can negotiate.
pub const MAX_CHANNELS: usize = muxnet_transport::MAX_CHANNEL_COUNT;

/// Check `channel` against a connection opened with `channel_count` channels.
pub fn validate_channel(channel: usize, channel_count: usize) -> Result<Channel> {
    let limit = channel_count.min(MAX_CHANNELS);
    if channel >= limit {
        return Err(FrameError::InvalidChannel { channel, limit });
    }
    Ok(channel as Channel)
}
