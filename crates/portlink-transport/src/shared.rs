//! A worker instance that many clients connect to.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tracing::debug;

use crate::{
    expose::{Exposed, serve},
    locks::LockManager,
    port::{self, ClientPort},
};

/// Handle to a running shared worker.
///
/// Clones refer to the same worker. Each `connect` opens an independent
/// port served by the same exposed object.
#[derive(Clone)]
pub struct SharedWorker {
    name: Arc<str>,
    target: Arc<dyn Exposed>,
    locks: LockManager,
    connections: Arc<AtomicUsize>,
}

impl SharedWorker {
    #[must_use]
    pub fn new(name: impl Into<String>, target: Arc<dyn Exposed>, locks: LockManager) -> Self {
        Self {
            name: Arc::from(name.into()),
            target,
            locks,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locks shared between the worker and its clients.
    #[must_use]
    pub const fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Open a new port to the worker.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn connect(&self) -> ClientPort {
        let (client, worker) = port::channel();
        let connections = Arc::clone(&self.connections);
        let count = connections.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(worker = %self.name, connections = count, "port opened");

        let target = Arc::clone(&self.target);
        let name = Arc::clone(&self.name);
        tokio::spawn(async move {
            serve(target, worker).await;
            let count = connections.fetch_sub(1, Ordering::Relaxed) - 1;
            debug!(worker = %name, connections = count, "port closed");
        });

        client
    }

    /// Number of open ports.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for SharedWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWorker")
            .field("name", &self.name)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}
