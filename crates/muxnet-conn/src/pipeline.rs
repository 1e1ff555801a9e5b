//! Outbound send pipeline.
//!
//! One FIFO per channel number, shared by every connection of the runtime, each
//! drained by its own lazily spawned worker thread. Enqueueing never touches the
//! transport. Workers take the transport lock before popping, so a message is
//! popped and handed to its host in one critical section and per-connection
//! FIFO order survives [`OutboundPipeline::flush_origin`].

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use muxnet_frame::{encode_header, Channel};
use muxnet_transport::{PeerId, TransportError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::completion::Completion;
use crate::error::{NetError, Result};
use crate::hosts::{HostId, HostTable};

/// Where a queued message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Peer(PeerId),
    /// Every connected peer of the host.
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub host: HostId,
    pub target: Target,
}

/// A message waiting for its channel worker.
pub(crate) struct PendingSend {
    pub msg_type: u32,
    pub channel: Channel,
    pub header: Bytes,
    pub payload: Bytes,
    pub destination: Destination,
    /// Id of the connection or server that queued it.
    pub origin: u64,
    pub completion: Option<Completion>,
}

impl Drop for PendingSend {
    fn drop(&mut self) {
        // Never handed to the transport.
        if let Some(completion) = self.completion.take() {
            completion.finish(false);
        }
    }
}

struct Lane {
    channel: Channel,
    queue: Mutex<VecDeque<PendingSend>>,
    ready: Condvar,
}

impl Lane {
    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingSend>> {
        self.queue.lock()
    }
}

pub(crate) struct OutboundPipeline {
    hosts: Arc<Mutex<HostTable>>,
    lanes: Mutex<HashMap<Channel, Arc<Lane>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    threaded: bool,
    idle_wait: Duration,
}

impl OutboundPipeline {
    pub fn new(hosts: Arc<Mutex<HostTable>>, threaded: bool, idle_wait: Duration) -> Self {
        Self {
            hosts,
            lanes: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            threaded,
            idle_wait,
        }
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<Channel, Arc<Lane>>> {
        self.lanes.lock()
    }

    /// Append to the channel's queue, starting its worker on first use.
    pub fn enqueue(&self, send: PendingSend) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(NetError::RuntimeShutdown);
        }
        let lane = self.lane(send.channel)?;
        lane.lock().push_back(send);
        lane.ready.notify_one();
        Ok(())
    }

    fn lane(&self, channel: Channel) -> Result<Arc<Lane>> {
        let mut lanes = self.lanes();
        if let Some(lane) = lanes.get(&channel) {
            return Ok(Arc::clone(lane));
        }

        let lane = Arc::new(Lane {
            channel,
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        });
        if self.threaded {
            let name = format!("muxnet-send-{channel}");
            let worker = {
                let lane = Arc::clone(&lane);
                let hosts = Arc::clone(&self.hosts);
                let shutdown = Arc::clone(&self.shutdown);
                let idle_wait = self.idle_wait;
                thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || run_worker(&lane, &hosts, &shutdown, idle_wait))
                    .map_err(|source| NetError::Spawn { name, source })?
            };
            self.workers.lock().push(worker);
            debug!(channel, "sender worker started");
        }
        lanes.insert(channel, Arc::clone(&lane));
        Ok(lane)
    }

    fn snapshot(&self) -> Vec<Arc<Lane>> {
        let mut lanes: Vec<Arc<Lane>> = self.lanes().values().cloned().collect();
        lanes.sort_by_key(|lane| lane.channel);
        lanes
    }

    /// Messages queued and not yet handed to the transport.
    pub fn pending(&self) -> usize {
        self.snapshot().iter().map(|lane| lane.lock().len()).sum()
    }

    /// Synchronously hand every queued message of `origin` to the transport.
    pub fn flush_origin(&self, origin: u64) -> usize {
        let mut table = self.hosts.lock();
        let mut sent = 0;
        for lane in self.snapshot() {
            let mine: VecDeque<PendingSend> = {
                let mut queue = lane.lock();
                let (mine, rest): (VecDeque<_>, VecDeque<_>) = mem::take(&mut *queue)
                    .into_iter()
                    .partition(|send| send.origin == origin);
                *queue = rest;
                mine
            };
            sent += mine.len();
            for send in mine {
                transmit(&mut table, send);
            }
        }
        if sent > 0 {
            debug!(origin, sent, "flushed queued sends");
        }
        sent
    }

    /// Drain every queue on the calling thread. Used without worker threads.
    pub fn drain_inline(&self) -> usize {
        let mut table = self.hosts.lock();
        let mut sent = 0;
        for lane in self.snapshot() {
            loop {
                let next = lane.lock().pop_front();
                let Some(send) = next else {
                    break;
                };
                transmit(&mut table, send);
                sent += 1;
            }
        }
        sent
    }

    /// Stop and join every worker, then drop whatever is still queued.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let lanes: Vec<Arc<Lane>> = self.lanes().drain().map(|(_, lane)| lane).collect();
        for lane in &lanes {
            lane.ready.notify_all();
        }

        let workers: Vec<JoinHandle<()>> = mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                warn!("sender worker panicked");
            }
        }

        let mut discarded = 0;
        for lane in lanes {
            let mut queue = lane.lock();
            discarded += queue.len();
            queue.clear();
        }
        debug!(discarded, "outbound pipeline shut down");
    }
}

impl Drop for OutboundPipeline {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for lane in self.lanes().values() {
            lane.ready.notify_all();
        }
    }
}

fn run_worker(lane: &Lane, hosts: &Mutex<HostTable>, shutdown: &AtomicBool, idle_wait: Duration) {
    loop {
        {
            let mut queue = lane.lock();
            while queue.is_empty() {
                if shutdown.load(Ordering::Acquire) {
                    trace!(channel = lane.channel, "sender worker exiting");
                    return;
                }
                lane.ready.wait_for(&mut queue, idle_wait);
            }
        }

        // Lock order is transport first, then the queue.
        let mut table = hosts.lock();
        let next = lane.lock().pop_front();
        if let Some(send) = next {
            transmit(&mut table, send);
        }
    }
}

/// Send the header packet then the data packet, and flush the host. A tracked
/// send completes once both are flushed. Sends to a host or peer that no longer
/// exists are discarded.
fn transmit(table: &mut HostTable, mut send: PendingSend) {
    let Destination { host: host_id, target } = send.destination;
    let channel = send.channel;
    let Some(host) = table.get_mut(host_id) else {
        debug!(host = %host_id, channel, origin = send.origin, "destination host gone, discarding send");
        return;
    };

    let header = encode_header(send.msg_type, channel, &send.header);
    match target {
        Target::Peer(peer) => {
            let sent = host
                .send(peer, channel, &header)
                .and_then(|()| host.send(peer, channel, &send.payload));
            match sent {
                Ok(()) => {}
                Err(TransportError::UnknownPeer(_) | TransportError::Disconnecting(_)) => {
                    debug!(host = %host_id, %peer, channel, "destination peer gone, discarding send");
                    return;
                }
                Err(err) => {
                    warn!(host = %host_id, %peer, channel, error = %err, "send rejected by transport");
                    return;
                }
            }
        }
        Target::Broadcast => {
            host.broadcast(channel, &header);
            host.broadcast(channel, &send.payload);
        }
    }
    host.flush();
    trace!(host = %host_id, channel, msg_type = send.msg_type, "message handed to transport");
    if let Some(completion) = send.completion.take() {
        completion.finish(true);
    }
}
