//! The network runtime: owner of every host, the send pipeline, the receiver
//! loop and the registry of live servers and client connections.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::connection::ConnectionInner;
use crate::error::{NetError, Result};
use crate::hosts::HostTable;
use crate::pipeline::OutboundPipeline;
use crate::receiver::ReceiverLoop;
use crate::server::ServerInner;

#[derive(Default)]
struct Registry {
    servers: Vec<Weak<ServerInner>>,
    clients: Vec<Weak<ConnectionInner>>,
}

pub(crate) struct Shared {
    config: NetworkConfig,
    hosts: Arc<Mutex<HostTable>>,
    pub(crate) pipeline: OutboundPipeline,
    registry: Mutex<Registry>,
    receiver: Mutex<Option<ReceiverLoop>>,
    interval_us: AtomicU64,
    shut_down: AtomicBool,
    next_id: AtomicU64,
    last_backlog: AtomicUsize,
}

impl Shared {
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// The global transport lock.
    pub fn lock_hosts(&self) -> MutexGuard<'_, HostTable> {
        self.hosts.lock()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock()
    }

    /// Ids shared by connections and servers; used as pipeline origins.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_threaded(&self) -> bool {
        self.config.threaded
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(NetError::RuntimeShutdown);
        }
        Ok(())
    }

    pub fn communication_interval(&self) -> Duration {
        Duration::from_micros(self.interval_us.load(Ordering::Relaxed))
    }

    pub fn register_server(self: &Arc<Self>, server: &Arc<ServerInner>) -> Result<()> {
        self.registry().servers.push(Arc::downgrade(server));
        self.start_receiver()
    }

    pub fn register_client(self: &Arc<Self>, client: &Arc<ConnectionInner>) -> Result<()> {
        self.registry().clients.push(Arc::downgrade(client));
        self.start_receiver()
    }

    pub fn unregister_server(&self, server: *const ServerInner) {
        self.registry()
            .servers
            .retain(|weak| weak.strong_count() > 0 && weak.as_ptr() != server);
    }

    fn start_receiver(self: &Arc<Self>) -> Result<()> {
        if !self.config.threaded {
            return Ok(());
        }
        let mut receiver = self.receiver.lock();
        if receiver.is_none() && !self.shut_down.load(Ordering::Acquire) {
            *receiver = Some(ReceiverLoop::spawn(Arc::downgrade(self))?);
        }
        Ok(())
    }

    /// One non-blocking pass over every live registration. Returns how many
    /// were serviced.
    pub fn service(&self) -> usize {
        if !self.config.threaded {
            self.pipeline.drain_inline();
        }

        let (servers, clients) = {
            let mut registry = self.registry();
            registry.servers.retain(|weak| weak.strong_count() > 0);
            registry.clients.retain(|weak| {
                weak.upgrade()
                    .is_some_and(|client| client.is_live())
            });
            let servers: Vec<Arc<ServerInner>> =
                registry.servers.iter().filter_map(Weak::upgrade).collect();
            let clients: Vec<Arc<ConnectionInner>> =
                registry.clients.iter().filter_map(Weak::upgrade).collect();
            (servers, clients)
        };

        for server in &servers {
            server.service_host();
        }
        for client in &clients {
            client.service_client();
        }

        self.last_backlog.store(self.backlog(), Ordering::Relaxed);
        servers.len() + clients.len()
    }

    pub fn backlog(&self) -> usize {
        self.pipeline.pending() + self.lock_hosts().backlog()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shut_down.store(true, Ordering::Release);
    }
}

/// Handle on a network runtime. Cheap to clone; every clone refers to the same
/// runtime.
///
/// The runtime replaces process-wide state: servers and connections are created
/// against a runtime, and [`NetworkRuntime::shutdown`] tears all of them down.
#[derive(Clone)]
pub struct NetworkRuntime {
    shared: Arc<Shared>,
}

impl NetworkRuntime {
    /// Start a runtime. Worker threads are spawned lazily, on the first server,
    /// client or send that needs them.
    pub fn init(config: NetworkConfig) -> Result<Self> {
        if config.sender_idle_wait.is_zero() {
            return Err(NetError::InvalidConfig("sender_idle_wait must be positive"));
        }

        let hosts = Arc::new(Mutex::new(HostTable::default()));
        let pipeline =
            OutboundPipeline::new(Arc::clone(&hosts), config.threaded, config.sender_idle_wait);
        let interval_us = config.communication_interval.as_micros() as u64;

        info!(
            threaded = config.threaded,
            interval = ?config.communication_interval,
            "network runtime initialized"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                hosts,
                pipeline,
                registry: Mutex::new(Registry::default()),
                receiver: Mutex::new(None),
                interval_us: AtomicU64::new(interval_us),
                shut_down: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                last_backlog: AtomicUsize::new(0),
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// The configuration this runtime was started with.
    pub fn config(&self) -> &NetworkConfig {
        self.shared.config()
    }

    /// Pump the network on the calling thread.
    ///
    /// Without background threads this is what moves data: queued sends are
    /// handed to the transport, then every live server and client is serviced.
    /// With background threads it is an extra, harmless pass.
    pub fn service_network(&self) {
        if self.shared.ensure_running().is_err() {
            return;
        }
        self.shared.service();
    }

    /// Messages queued for sending plus packets the transport has not put on
    /// the wire, over every live host. Zero when nothing is outstanding.
    pub fn network_send_backlog(&self) -> usize {
        self.shared.backlog()
    }

    /// Backlog observed at the end of the last service pass.
    pub fn last_observed_backlog(&self) -> usize {
        self.shared.last_backlog.load(Ordering::Relaxed)
    }

    /// Pause between receiver loop passes. Blocking connection calls pump at
    /// this pace in cooperative mode.
    pub fn set_communication_interval(&self, interval: Duration) {
        self.shared
            .interval_us
            .store(interval.as_micros() as u64, Ordering::Relaxed);
    }

    /// Current pause between receiver loop passes.
    pub fn communication_interval(&self) -> Duration {
        self.shared.communication_interval()
    }

    /// Whether [`NetworkRuntime::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.shared.ensure_running().is_err()
    }

    /// Stop the receiver loop and sender workers, stop every server and
    /// force-disconnect every client. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("network runtime shutting down");

        let receiver = self.shared.receiver.lock().take();
        if let Some(receiver) = receiver {
            receiver.stop();
        }

        let (servers, clients) = {
            let mut registry = self.shared.registry();
            let servers: Vec<Arc<ServerInner>> = registry
                .servers
                .drain(..)
                .filter_map(|weak| weak.upgrade())
                .collect();
            let clients: Vec<Arc<ConnectionInner>> = registry
                .clients
                .drain(..)
                .filter_map(|weak| weak.upgrade())
                .collect();
            (servers, clients)
        };
        for server in servers {
            server.stop();
        }
        for client in clients {
            client.force_teardown();
        }

        self.shared.pipeline.shutdown();
        let remaining = {
            let mut table = self.shared.lock_hosts();
            let remaining = table.len();
            table.clear();
            remaining
        };
        debug!(remaining_hosts = remaining, "network runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_thread_safe<T: Send + Sync>() {}

    #[test]
    fn handles_cross_threads() {
        assert_thread_safe::<NetworkRuntime>();
        assert_thread_safe::<crate::Connection>();
        assert_thread_safe::<crate::Server>();
        assert_thread_safe::<Shared>();
    }

    #[test]
    fn init_rejects_unusable_config() {
        let config = NetworkConfig {
            sender_idle_wait: Duration::ZERO,
            ..NetworkConfig::default()
        };
        assert!(matches!(
            NetworkRuntime::init(config),
            Err(NetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn communication_interval_is_adjustable() {
        let runtime = NetworkRuntime::init(NetworkConfig::cooperative()).expect("runtime should start");
        assert_eq!(runtime.communication_interval(), Duration::from_millis(2));
        runtime.set_communication_interval(Duration::from_millis(5));
        assert_eq!(runtime.communication_interval(), Duration::from_millis(5));
    }

    #[test]
    fn empty_runtime_has_no_backlog() {
        let runtime = NetworkRuntime::init(NetworkConfig::default()).expect("runtime should start");
        runtime.service_network();
        assert_eq!(runtime.network_send_backlog(), 0);
        assert_eq!(runtime.last_observed_backlog(), 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let runtime = NetworkRuntime::init(NetworkConfig::default()).expect("runtime should start");
        runtime.shutdown();
        runtime.shutdown();
        assert!(runtime.is_shut_down());
    }
}
