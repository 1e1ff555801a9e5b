use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{NetError, Result};
use crate::runtime::Shared;

const THREAD_NAME: &str = "muxnet-receiver";

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// The background thread polling every live server and client host.
///
/// It holds the runtime weakly and exits once the runtime is gone or
/// [`ReceiverLoop::stop`] is called.
pub(crate) struct ReceiverLoop {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiverLoop {
    pub fn spawn(shared: Weak<Shared>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(&shared, &flag))
            .map_err(|source| NetError::Spawn {
                name: THREAD_NAME.to_string(),
                source,
            })?;
        debug!("receiver loop started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the loop and wait for its current iteration to finish.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("receiver loop panicked");
        }
        debug!("receiver loop stopped");
    }
}

impl Drop for ReceiverLoop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

fn run(shared: &Weak<Shared>, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        let Some(runtime) = shared.upgrade() else {
            break;
        };
        let interval = runtime.communication_interval();
        runtime.service();
        drop(runtime);

        // Host polls never block, so the pause happens here, outside every lock.
        thread::sleep(interval.max(IDLE_SLEEP));
    }
}
