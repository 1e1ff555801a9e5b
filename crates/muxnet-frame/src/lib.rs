//! Message framing on top of the muxnet transport.
//!
//! Every logical message travels as two reliable packets on its channel:
//! - A header packet: 4-byte big-endian type, 4-byte big-endian channel,
//!   then optional application header bytes
//! - A data packet carrying the payload
//!
//! [`MessageFramer`] pairs them back up and [`InboundQueue`] holds the results
//! until the application reads them through a [`MessageIterator`].

pub mod channel;
pub mod codec;
pub mod error;
pub mod framer;
pub mod queue;

pub use channel::{validate_channel, Channel, MAX_CHANNELS};
pub use codec::{decode_header, encode_header, Header, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use framer::{Message, MessageFramer};
pub use queue::{InboundQueue, MessageIterator};
