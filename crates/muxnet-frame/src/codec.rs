use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::channel::Channel;
use crate::error::{FrameError, Result};

/// Header packet prefix: type (4) + channel (4) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// A decoded header packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub msg_type: u32,
    pub channel: u32,
    /// Application header bytes following the fixed prefix.
    pub extra: Bytes,
}

/// Encode the header packet of a message.
///
/// Wire format:
/// ```text
/// ┌─────────────┬──────────────┬─────────────────────┐
/// │ Type        │ Channel      │ Extra header bytes  │
/// │ (4B BE)     │ (4B BE)      │ (0..n bytes)        │
/// └─────────────┴──────────────┴─────────────────────┘
/// ```
/// The payload travels in the following data packet, its length implied by the
/// packet size.
pub fn encode_header(msg_type: u32, channel: Channel, extra: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + extra.len());
    dst.put_u32(msg_type);
    dst.put_u32(u32::from(channel));
    dst.put_slice(extra);
    dst.freeze()
}

/// Decode a header packet.
pub fn decode_header(packet: &Bytes) -> Result<Header> {
    if packet.len() < HEADER_SIZE {
        return Err(FrameError::HeaderTooShort {
            len: packet.len(),
            min: HEADER_SIZE,
        });
    }

    let mut src = packet.clone();
    let msg_type = src.get_u32();
    let channel = src.get_u32();

    Ok(Header {
        msg_type,
        channel,
        extra: src,
    })
}
