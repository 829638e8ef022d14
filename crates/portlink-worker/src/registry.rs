//! Registry of connected clients and their live subscriptions.
//!
//! Every client that called `registerClient` has a record here. The record
//! owns the client's live subscriptions; deregistering the client tears all
//! of them down. Deregistration is driven by the client's liveness lock:
//! the registry queues on the lock named after the client id, and acquiring
//! it means the client is gone.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use portlink_core::{ClientId, SourceSubscription};
use portlink_transport::{LockManager, LockTicket};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::HandlerError;

/// Identifier of a live subscription within a registry.
pub type SubscriptionId = u64;

#[derive(Default)]
struct SetState {
    closed: bool,
    live: HashMap<SubscriptionId, SourceSubscription>,
}

/// Live subscriptions of one client.
#[derive(Default)]
pub struct SubscriptionSet {
    state: Mutex<SetState>,
}

impl SubscriptionSet {
    /// Add a subscription.
    ///
    /// # Errors
    /// Hands the subscription back if the client was deregistered.
    pub fn insert(
        &self,
        id: SubscriptionId,
        subscription: SourceSubscription,
    ) -> Result<(), SourceSubscription> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(subscription);
        }
        state.live.insert(id, subscription);
        Ok(())
    }

    /// Take a subscription out of the set. Dropping it unsubscribes.
    pub fn remove(&self, id: SubscriptionId) -> Option<SourceSubscription> {
        self.state.lock().live.remove(&id)
    }

    /// Refuse further inserts and take every live subscription.
    pub fn close(&self) -> Vec<SourceSubscription> {
        let mut state = self.state.lock();
        state.closed = true;
        state.live.drain().map(|(_, subscription)| subscription).collect()
    }

    #[must_use]
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.state.lock().live.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the owning client was deregistered.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl fmt::Debug for SubscriptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionSet")
            .field("closed", &state.closed)
            .field("live", &state.live.len())
            .finish()
    }
}

/// Worker-side record of a registered client.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub client_id: ClientId,
    pub subscriptions: Arc<SubscriptionSet>,
}

struct Entry {
    record: ClientRecord,
    lease: Option<LockTicket>,
    generation: u64,
    watcher: AbortHandle,
}

impl Entry {
    fn tear_down(self) -> usize {
        self.watcher.abort();
        let live = self.record.subscriptions.close();
        let count = live.len();
        for subscription in live {
            subscription.unsubscribe();
        }
        count
    }
}

struct RegistryInner {
    records: Mutex<HashMap<ClientId, Entry>>,
    locks: LockManager,
    next_subscription: AtomicU64,
    next_generation: AtomicU64,
}

/// Shared registry of client records.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

impl ClientRegistry {
    /// Create a registry watching leases on `locks`.
    #[must_use]
    pub fn new(locks: LockManager) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                records: Mutex::new(HashMap::new()),
                locks,
                next_subscription: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Register a client.
    ///
    /// The record is tied to whoever holds the client's lock right now.
    /// Registering again under the same holder is a no-op. Registering under
    /// a new holder means the id changed hands: the stale record is torn
    /// down and replaced.
    ///
    /// Returns `true` if a new record was created. A new record starts a
    /// lease watcher, so this must be called within a Tokio runtime.
    pub fn register(&self, client_id: &ClientId) -> bool {
        let lease = self.inner.locks.holder(client_id.as_str());
        let mut records = self.inner.records.lock();
        if records
            .get(client_id)
            .is_some_and(|entry| entry.lease == lease)
        {
            drop(records);
            debug!(client_id = %client_id, "client already registered");
            return false;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let watcher = self.watch_lease(client_id.clone(), generation);
        let stale = records.insert(
            client_id.clone(),
            Entry {
                record: ClientRecord {
                    client_id: client_id.clone(),
                    subscriptions: Arc::default(),
                },
                lease,
                generation,
                watcher,
            },
        );
        drop(records);

        if let Some(stale) = stale {
            let subscriptions = stale.tear_down();
            debug!(
                client_id = %client_id,
                subscriptions,
                "client id changed hands, stale record dropped"
            );
        }
        debug!(client_id = %client_id, ?lease, "client registered");
        true
    }

    /// Queue on the client's lock now and deregister once it is granted.
    fn watch_lease(&self, client_id: ClientId, generation: u64) -> AbortHandle {
        let registry = Arc::downgrade(&self.inner);
        let request = self.inner.locks.request(client_id.as_str());

        tokio::spawn(async move {
            let _guard = request.await;
            debug!(client_id = %client_id, "client lease released");
            if let Some(inner) = Weak::upgrade(&registry) {
                Self { inner }.expire(&client_id, generation);
            }
        })
        .abort_handle()
    }

    fn expire(&self, client_id: &ClientId, generation: u64) {
        let entry = {
            let mut records = self.inner.records.lock();
            if records
                .get(client_id)
                .is_none_or(|entry| entry.generation != generation)
            {
                return;
            }
            records.remove(client_id)
        };
        if let Some(entry) = entry {
            let subscriptions = entry.tear_down();
            debug!(client_id = %client_id, subscriptions, "client deregistered");
        }
    }

    /// Remove a client and unsubscribe all of its live subscriptions.
    ///
    /// Returns `false` (and logs a warning) for an unknown client.
    pub fn deregister(&self, client_id: &ClientId) -> bool {
        let entry = self.inner.records.lock().remove(client_id);
        let Some(entry) = entry else {
            warn!(client_id = %client_id, "deregister of unknown client");
            return false;
        };

        let subscriptions = entry.tear_down();
        debug!(client_id = %client_id, subscriptions, "client deregistered");
        true
    }

    /// Subscription set of a registered client.
    ///
    /// # Errors
    /// Returns `HandlerError::UnknownClient` if the client has no record.
    pub fn require(&self, client_id: &ClientId) -> Result<Arc<SubscriptionSet>, HandlerError> {
        self.inner
            .records
            .lock()
            .get(client_id)
            .map(|entry| Arc::clone(&entry.record.subscriptions))
            .ok_or_else(|| HandlerError::UnknownClient(client_id.clone()))
    }

    #[must_use]
    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.inner.records.lock().contains_key(client_id)
    }

    #[must_use]
    pub fn get(&self, client_id: &ClientId) -> Option<ClientRecord> {
        self.inner
            .records
            .lock()
            .get(client_id)
            .map(|entry| entry.record.clone())
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every registered client.
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.inner.records.lock().keys().cloned().collect()
    }

    /// Live subscription count of a client; zero if unknown.
    #[must_use]
    pub fn subscription_count(&self, client_id: &ClientId) -> usize {
        self.require(client_id).map_or(0, |set| set.len())
    }

    /// Locks the registry watches.
    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    pub(crate) fn next_subscription_id(&self) -> SubscriptionId {
        self.inner.next_subscription.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(LockManager::new())
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.len())
            .finish_non_exhaustive()
    }
}
