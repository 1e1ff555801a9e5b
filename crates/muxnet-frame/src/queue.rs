//! Per-channel inbound message queues and the cursor used to consume them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::channel::Channel;
use crate::error::Result;
use crate::framer::{Message, MessageFramer};

struct Inner {
    framer: MessageFramer,
    messages: VecDeque<Message>,
}

/// Thread-safe FIFO of completed messages for one channel of one connection.
///
/// The network side feeds raw packets through [`InboundQueue::half_push_back`];
/// application threads consume through a [`MessageIterator`].
pub struct InboundQueue {
    channel: Channel,
    inner: Mutex<Inner>,
    arrived: Condvar,
}

impl InboundQueue {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            inner: Mutex::new(Inner {
                framer: MessageFramer::new(channel),
                messages: VecDeque::new(),
            }),
            arrived: Condvar::new(),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    /// Feed one raw packet. Returns `true` when it completed a message.
    pub fn half_push_back(&self, packet: Bytes) -> Result<bool> {
        let mut inner = self.lock();
        match inner.framer.half_push_back(packet)? {
            Some(message) => {
                inner.messages.push_back(message);
                drop(inner);
                self.arrived.notify_all();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    pub fn front(&self) -> Option<Message> {
        self.lock().messages.front().cloned()
    }

    pub fn pop(&self) -> Option<Message> {
        self.lock().messages.pop_front()
    }

    /// Drop the front message. Returns `false` if the queue was empty.
    pub fn pop_front_discard(&self) -> bool {
        self.lock().messages.pop_front().is_some()
    }

    /// Whether a header packet is waiting for its data packet.
    pub fn has_pending_header(&self) -> bool {
        self.lock().framer.pending_header().is_some()
    }

    /// Block until a message is queued or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.messages.is_empty() {
            if self.arrived.wait_until(&mut inner, deadline).timed_out() {
                return !inner.messages.is_empty();
            }
        }
        true
    }
}

/// Cursor over an [`InboundQueue`].
///
/// The cursor style is `is_valid()` / accessors / `advance()`. Reading or
/// advancing an invalid cursor is a programming error: it panics in debug builds
/// and yields empty values in release builds. The iterator impl drains the queue
/// without those checks.
pub struct MessageIterator {
    queue: Arc<InboundQueue>,
}

impl MessageIterator {
    pub fn new(queue: Arc<InboundQueue>) -> Self {
        Self { queue }
    }

    pub fn is_valid(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Discard the current message.
    pub fn advance(&mut self) {
        let popped = self.queue.pop_front_discard();
        debug_assert!(popped, "advance() on a message iterator that is not valid");
    }

    pub fn message(&self) -> Option<Message> {
        self.queue.front()
    }

    fn current(&self) -> Option<Message> {
        let current = self.queue.front();
        debug_assert!(current.is_some(), "read from a message iterator that is not valid");
        current
    }

    /// Type of the current message.
    pub fn msg_type(&self) -> u32 {
        self.current().map_or(0, |m| m.msg_type)
    }

    pub fn channel(&self) -> Channel {
        self.queue.channel()
    }

    pub fn payload(&self) -> Bytes {
        self.current().map(|m| m.payload).unwrap_or_default()
    }

    /// Application header bytes of the current message.
    pub fn header(&self) -> Bytes {
        self.current().map(|m| m.header).unwrap_or_default()
    }

    /// Payload size of the current message.
    pub fn size(&self) -> usize {
        self.current().map_or(0, |m| m.size())
    }

    /// Messages currently waiting, including the current one.
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// Block until the cursor is valid or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.queue.wait(timeout)
    }
}

impl Iterator for MessageIterator {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        self.queue.pop()
    }
}
