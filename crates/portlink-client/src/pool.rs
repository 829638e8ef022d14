//! Explicit cache of worker endpoints.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use portlink_core::Contract;
use portlink_transport::SharedWorker;
use tracing::debug;

use crate::{Client, ClientError, ClientOptions};

/// Worker endpoints by name, created once per logical endpoint.
///
/// Clones share the same cache.
#[derive(Clone, Default)]
pub struct ConnectionPool {
    workers: Arc<Mutex<HashMap<String, SharedWorker>>>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoint called `name`, created with `create` on first use.
    pub fn get_or_insert_with(
        &self,
        name: &str,
        create: impl FnOnce() -> SharedWorker,
    ) -> SharedWorker {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.get(name) {
            return worker.clone();
        }
        let worker = create();
        debug!(endpoint = name, "endpoint created");
        workers.insert(name.to_string(), worker.clone());
        worker
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<SharedWorker> {
        self.workers.lock().get(name).cloned()
    }

    /// Connect a new client to the endpoint called `name`.
    ///
    /// # Errors
    /// Returns `ClientError::UnknownEndpoint` if no such endpoint exists, or
    /// the registration error.
    pub async fn client<C: Contract>(
        &self,
        name: &str,
        options: ClientOptions,
    ) -> Result<Client<C>, ClientError> {
        let worker = self
            .get(name)
            .ok_or_else(|| ClientError::UnknownEndpoint(name.to_string()))?;
        Client::connect(&worker, options).await
    }

    /// Forget an endpoint. Connected clients keep working.
    pub fn remove(&self, name: &str) -> Option<SharedWorker> {
        self.workers.lock().remove(name)
    }

    pub fn clear(&self) {
        self.workers.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let workers = self.workers.lock();
        let mut names: Vec<_> = workers.keys().collect();
        names.sort();
        f.debug_struct("ConnectionPool")
            .field("endpoints", &names)
            .finish()
    }
}
