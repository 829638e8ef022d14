//! Client creation and registration.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use portlink_core::{Call, ClientId, Contract, RegisterClient, RegistryContract, Subscription};
use portlink_transport::{LockGuard, Remote, SharedWorker};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ClientError, DispatchProxy, PendingCall, SharedSubscription, Subscriptions};

/// Client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Fixed client id; a random UUID when absent.
    pub client_id: Option<String>,
}

/// Liveness lease: the held lock named after the client id.
pub(crate) struct Lease {
    client_id: ClientId,
    guard: Mutex<Option<LockGuard>>,
}

impl Lease {
    fn release(&self) -> bool {
        let guard = self.guard.lock().take();
        if guard.is_some() {
            debug!(client_id = %self.client_id, "lease released");
        }
        guard.is_some()
    }

    pub(crate) fn is_held(&self) -> bool {
        self.guard.lock().is_some()
    }
}

/// Registered client of a shared worker.
///
/// Clones share the registration. The worker forgets the client once the
/// last clone (and every proxy or subscription derived from it) is dropped,
/// or after `disconnect`.
pub struct Client<C> {
    proxy: DispatchProxy<C>,
    subscriptions: Subscriptions<C>,
    lease: Arc<Lease>,
}

impl<C> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            proxy: self.proxy.clone(),
            subscriptions: self.subscriptions.clone(),
            lease: Arc::clone(&self.lease),
        }
    }
}

impl<C> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.lease.client_id)
            .field("connected", &self.lease.is_held())
            .finish()
    }
}

impl<C: Contract> Client<C> {
    /// Connect to `worker` and register.
    ///
    /// Waits for the liveness lock first, so a second client reusing a
    /// live id waits until the first one is gone.
    ///
    /// # Errors
    /// Returns `ClientError::Registration` if the worker rejects the
    /// registration or the channel closes.
    pub async fn connect(
        worker: &SharedWorker,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let client_id = options
            .client_id
            .map_or_else(ClientId::random, ClientId::new);

        let guard = worker.locks().acquire(client_id.as_str()).await;
        let lease = Arc::new(Lease {
            client_id: client_id.clone(),
            guard: Mutex::new(Some(guard)),
        });

        let remote = Remote::wrap(worker.connect());
        let proxy = DispatchProxy::with_lease(remote, client_id.clone(), Arc::clone(&lease));
        proxy
            .cast::<RegistryContract>()
            .call::<RegisterClient>(())
            .await?;

        debug!(client_id = %client_id, worker = worker.name(), "client connected");
        Ok(Self {
            subscriptions: Subscriptions::new(proxy.clone()),
            proxy,
            lease,
        })
    }

    #[must_use]
    pub const fn id(&self) -> &ClientId {
        self.proxy.client_id()
    }

    #[must_use]
    pub const fn proxy(&self) -> &DispatchProxy<C> {
        &self.proxy
    }

    #[must_use]
    pub const fn subscriptions(&self) -> &Subscriptions<C> {
        &self.subscriptions
    }

    /// Shorthand for `proxy().call::<Op>(input)`.
    pub fn call<Op>(&self, input: Op::Input) -> PendingCall<Op::Output>
    where
        Op: Call<Contract = C>,
    {
        self.proxy.call::<Op>(input)
    }

    /// Shorthand for `subscriptions().subscribe::<Op>(input)`.
    pub fn subscribe<Op>(&self, input: Op::Input) -> SharedSubscription<Op::Update>
    where
        Op: Subscription<Contract = C>,
        Op::Update: Clone,
    {
        self.subscriptions.subscribe::<Op>(input)
    }

    /// Release the liveness lease now.
    ///
    /// The worker then deregisters the client and tears down its
    /// subscriptions. Returns `false` if already disconnected.
    pub fn disconnect(&self) -> bool {
        self.lease.release()
    }

    /// Whether the lease is still held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lease.is_held()
    }

    /// Split into the proxy and the subscription factory.
    ///
    /// Both keep the registration alive.
    #[must_use]
    pub fn into_parts(self) -> (DispatchProxy<C>, Subscriptions<C>) {
        (self.proxy, self.subscriptions)
    }
}
