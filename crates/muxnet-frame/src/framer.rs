use bytes::Bytes;
use tracing::trace;

use crate::channel::Channel;
use crate::codec::{decode_header, Header};
use crate::error::{FrameError, Result};

/// One logical message rebuilt from a header/data packet pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u32,
    pub channel: Channel,
    /// Application header bytes, empty unless the sender supplied some.
    pub header: Bytes,
    pub payload: Bytes,
    /// Position in the arrival stream of its channel, starting at 0.
    pub arrival: u64,
}

impl Message {
    /// Payload length in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

enum Pending {
    Header(Header),
    /// The header packet was unusable; its data packet is swallowed so the
    /// pairing stays aligned.
    Corrupt,
}

/// Pairs the packets arriving on one channel of one connection.
pub struct MessageFramer {
    channel: Channel,
    pending: Option<Pending>,
    arrivals: u64,
}

impl MessageFramer {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            pending: None,
            arrivals: 0,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Feed the next packet of the arrival stream.
    ///
    /// With no header pending, `packet` is parsed as a header and `Ok(None)` is
    /// returned. Otherwise it is the data packet: the pending slot is cleared and
    /// the completed message returned. A bad header is reported once; the data
    /// packet that follows it is dropped.
    pub fn half_push_back(&mut self, packet: Bytes) -> Result<Option<Message>> {
        match self.pending.take() {
            None => {
                let header = match decode_header(&packet) {
                    Ok(header) => header,
                    Err(err) => {
                        self.pending = Some(Pending::Corrupt);
                        return Err(err);
                    }
                };
                if header.channel != u32::from(self.channel) {
                    self.pending = Some(Pending::Corrupt);
                    return Err(FrameError::ChannelMismatch {
                        expected: self.channel,
                        found: header.channel,
                    });
                }
                self.pending = Some(Pending::Header(header));
                Ok(None)
            }
            Some(Pending::Header(header)) => {
                let message = Message {
                    msg_type: header.msg_type,
                    channel: self.channel,
                    header: header.extra,
                    payload: packet,
                    arrival: self.arrivals,
                };
                self.arrivals += 1;
                Ok(Some(message))
            }
            Some(Pending::Corrupt) => {
                trace!(channel = self.channel, len = packet.len(), "dropping data packet of bad header");
                Ok(None)
            }
        }
    }

    /// The header waiting for its data packet, if any.
    pub fn pending_header(&self) -> Option<&Header> {
        match &self.pending {
            Some(Pending::Header(header)) => Some(header),
            _ => None,
        }
    }

    /// Messages completed so far.
    pub fn completed(&self) -> u64 {
        self.arrivals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_header;

    #[test]
    fn test_header_then_data_completes_message() {
        let mut framer = MessageFramer::new(0);
        assert!(framer
            .half_push_back(encode_header(5, 0, b""))
            .unwrap()
            .is_none());
        assert_eq!(framer.pending_header().map(|h| h.msg_type), Some(5));

        let message = framer
            .half_push_back(Bytes::from_static(b"hello"))
            .unwrap()
            .unwrap();
        assert_eq!(message.msg_type, 5);
        assert_eq!(message.channel, 0);
        assert_eq!(message.payload.as_ref(), b"hello");
        assert_eq!(message.arrival, 0);
        assert!(framer.pending_header().is_none());
    }

    #[test]
    fn test_arrival_order_counts_up() {
        let mut framer = MessageFramer::new(2);
        for expected in 0..3u64 {
            framer.half_push_back(encode_header(1, 2, b"h")).unwrap();
            let message = framer.half_push_back(Bytes::new()).unwrap().unwrap();
            assert_eq!(message.arrival, expected);
            assert_eq!(message.header.as_ref(), b"h");
            assert_eq!(message.size(), 0);
        }
        assert_eq!(framer.completed(), 3);
    }

    #[test]
    fn test_bad_header_swallows_its_data_packet() {
        let mut framer = MessageFramer::new(0);
        assert!(framer.half_push_back(Bytes::from_static(b"xy")).is_err());
        assert!(framer
            .half_push_back(Bytes::from_static(b"orphan"))
            .unwrap()
            .is_none());

        framer.half_push_back(encode_header(9, 0, b"")).unwrap();
        let message = framer
            .half_push_back(Bytes::from_static(b"ok"))
            .unwrap()
            .unwrap();
        assert_eq!(message.msg_type, 9);
    }

    #[test]
    fn test_header_for_other_channel_is_rejected() {
        let mut framer = MessageFramer::new(1);
        let result = framer.half_push_back(encode_header(1, 0, b""));
        assert!(matches!(
            result,
            Err(FrameError::ChannelMismatch {
                expected: 1,
                found: 0
            })
        ));
    }
}
