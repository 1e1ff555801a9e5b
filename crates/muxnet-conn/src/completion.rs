//! Completion tickets for tracked sends.
//!
//! A tracked send hands its payload to the network layer and gets a
//! [`CompletionTicket`] back. Once the payload has been handed to the transport
//! and flushed, or discarded before that, the ticket completes and a
//! [`SendReceipt`] is queued for the owning connection to collect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use muxnet_frame::Channel;
use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct TicketState {
    done: Mutex<bool>,
    cv: Condvar,
}

/// Handle on one tracked send. Cheap to clone.
#[derive(Clone)]
pub struct CompletionTicket {
    id: u64,
    state: Arc<TicketState>,
}

impl CompletionTicket {
    /// Matches `SendReceipt::ticket`.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the send was transmitted or discarded.
    pub fn is_complete(&self) -> bool {
        *self.state.done.lock()
    }

    /// Block until complete or `timeout` elapses. Returns completion state.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.state.done.lock();
        while !*done {
            if self.state.cv.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    fn complete(&self) {
        *self.state.done.lock() = true;
        self.state.cv.notify_all();
    }
}

impl std::fmt::Debug for CompletionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionTicket")
            .field("id", &self.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Returned through `Connection::completed_sends` once a tracked payload is
/// transmitted or discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub ticket: u64,
    pub channel: Channel,
    pub payload: Bytes,
    /// False when the send was discarded before reaching the transport.
    pub transmitted: bool,
}

/// Receipts waiting for their owner.
#[derive(Default)]
pub(crate) struct CompletionQueue {
    next_id: AtomicU64,
    receipts: Mutex<VecDeque<SendReceipt>>,
}

impl CompletionQueue {
    pub fn issue(self: &Arc<Self>, channel: Channel, payload: Bytes) -> Completion {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Completion {
            ticket: CompletionTicket {
                id,
                state: Arc::default(),
            },
            queue: Arc::clone(self),
            channel,
            payload,
        }
    }

    pub fn drain(&self) -> Vec<SendReceipt> {
        self.receipts.lock().drain(..).collect()
    }
}

/// The sender side of a ticket, carried with the payload until it is sent.
pub(crate) struct Completion {
    ticket: CompletionTicket,
    queue: Arc<CompletionQueue>,
    channel: Channel,
    payload: Bytes,
}

impl Completion {
    pub fn ticket(&self) -> CompletionTicket {
        self.ticket.clone()
    }

    pub fn finish(self, transmitted: bool) {
        self.queue.receipts.lock().push_back(SendReceipt {
                ticket: self.ticket.id,
                channel: self.channel,
                payload: self.payload,
                transmitted,
            });
        self.ticket.complete();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn finish_completes_ticket_and_queues_receipt() {
        let queue = Arc::new(CompletionQueue::default());
        let completion = queue.issue(3, Bytes::from_static(b"buf"));
        let ticket = completion.ticket();
        assert!(!ticket.is_complete());

        completion.finish(true);
        assert!(ticket.is_complete());

        let receipts = queue.drain();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].ticket, ticket.id());
        assert_eq!(receipts[0].channel, 3);
        assert_eq!(receipts[0].payload.as_ref(), b"buf");
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn ids_are_distinct() {
        let queue = Arc::new(CompletionQueue::default());
        let a = queue.issue(0, Bytes::new()).ticket();
        let b = queue.issue(0, Bytes::new()).ticket();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn wait_returns_when_finished_elsewhere() {
        let queue = Arc::new(CompletionQueue::default());
        let completion = queue.issue(0, Bytes::new());
        let ticket = completion.ticket();

        let finisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completion.finish(false);
        });
        assert!(ticket.wait(Duration::from_secs(5)));
        finisher.join().expect("finisher thread should finish");
        assert!(!queue.drain()[0].transmitted);
    }

    #[test]
    fn wait_times_out() {
        let queue = Arc::new(CompletionQueue::default());
        let ticket = queue.issue(0, Bytes::new()).ticket();
        assert!(!ticket.wait(Duration::from_millis(10)));
    }
}
