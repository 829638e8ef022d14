//! Subscription adapter on the client side.
//!
//! A `SharedSubscription` is a lazily opened, reference-counted view of one
//! worker subscription. The first attached stream opens it; when the last
//! stream is dropped (or `cancel` is called) the worker subscription is
//! disposed. Streams attached later do not see earlier values.

use std::{
    collections::HashMap,
    fmt,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use futures::Stream;
use parking_lot::Mutex;
use portlink_core::{Contract, RemoteError, Subscription, SubscriptionState, Wire, value};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::{
    CallError, DispatchProxy,
    proxy::{PendingCall, PendingSubscription, RemoteDisposer},
};

type Item<T> = Result<T, RemoteError>;
type Open<T> = Box<dyn Fn(Weak<SharedInner<T>>, u64) -> PendingSubscription + Send + Sync>;

/// Factory of shared subscriptions for contract `C`.
pub struct Subscriptions<C> {
    proxy: DispatchProxy<C>,
}

impl<C> Clone for Subscriptions<C> {
    fn clone(&self) -> Self {
        Self {
            proxy: self.proxy.clone(),
        }
    }
}

impl<C> fmt::Debug for Subscriptions<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriptions")
            .field("client_id", self.proxy.client_id())
            .finish()
    }
}

impl<C> Subscriptions<C> {
    #[must_use]
    pub const fn new(proxy: DispatchProxy<C>) -> Self {
        Self { proxy }
    }
}

impl<C: Contract> Subscriptions<C> {
    /// Shared subscription to `Op` with a fixed input.
    ///
    /// Nothing is sent until the first stream is attached.
    pub fn subscribe<Op>(&self, input: Op::Input) -> SharedSubscription<Op::Update>
    where
        Op: Subscription<Contract = C>,
        Op::Update: Clone,
    {
        let proxy = self.proxy.clone();
        let input = value::encode_input(&input).map_err(|err| CallError::Encode {
            operation: Op::NAME,
            message: err.to_string(),
        });

        let open: Open<Op::Update> = Box::new(move |shared, generation| {
            let input = match &input {
                Ok(input) => input.clone(),
                Err(err) => return PendingCall::failed(err.clone()),
            };

            let on_next = {
                let shared = shared.clone();
                move |update| deliver(&shared, generation, Event::Next(update))
            };
            let on_error = {
                let shared = shared.clone();
                move |err| deliver(&shared, generation, Event::Error(err))
            };
            let on_complete = move || deliver(&shared, generation, Event::Complete);

            proxy.subscribe_encoded::<Op>(on_next, on_error, on_complete, input)
        });

        SharedSubscription {
            inner: Arc::new(SharedInner {
                operation: Op::NAME,
                open,
                state: Mutex::new(SharedState::default()),
            }),
        }
    }
}

enum Event<T> {
    Next(T),
    Error(RemoteError),
    Complete,
}

struct Session {
    generation: u64,
    cancel: oneshot::Sender<()>,
}

impl Session {
    /// Let the session task dispose the worker subscription.
    fn end(self) {
        let _ = self.cancel.send(());
    }
}

struct SharedState<T> {
    consumers: HashMap<u64, mpsc::UnboundedSender<Item<T>>>,
    next_consumer: u64,
    generation: u64,
    session: Option<Session>,
    lifecycle: SubscriptionState,
}

impl<T> Default for SharedState<T> {
    fn default() -> Self {
        Self {
            consumers: HashMap::new(),
            next_consumer: 0,
            generation: 0,
            session: None,
            lifecycle: SubscriptionState::Unopened,
        }
    }
}

struct SharedInner<T> {
    operation: &'static str,
    open: Open<T>,
    state: Mutex<SharedState<T>>,
}

fn deliver<T: Clone>(shared: &Weak<SharedInner<T>>, generation: u64, event: Event<T>) {
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let mut state = shared.state.lock();
    if state.session.as_ref().map(|s| s.generation) != Some(generation) {
        return;
    }

    match event {
        Event::Next(update) => {
            for consumer in state.consumers.values() {
                let _ = consumer.send(Ok(update.clone()));
            }
        }
        Event::Error(err) => {
            for (_, consumer) in state.consumers.drain() {
                let _ = consumer.send(Err(err.clone()));
            }
            if let Some(session) = state.session.take() {
                session.end();
            }
            state.lifecycle.transition(SubscriptionState::Errored);
            debug!(operation = shared.operation, code = %err.code, "subscription errored");
        }
        Event::Complete => {
            state.consumers.clear();
            if let Some(session) = state.session.take() {
                session.end();
            }
            state.lifecycle.transition(SubscriptionState::Completed);
            debug!(operation = shared.operation, "subscription completed");
        }
    }
}

/// Lazily opened worker subscription shared by many streams.
pub struct SharedSubscription<T> {
    inner: Arc<SharedInner<T>>,
}

impl<T> Clone for SharedSubscription<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for SharedSubscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SharedSubscription")
            .field("operation", &self.inner.operation)
            .field("state", &state.lifecycle)
            .field("consumers", &state.consumers.len())
            .finish()
    }
}

impl<T: Wire + Clone> SharedSubscription<T> {
    /// Attach a consumer.
    ///
    /// Opens the worker subscription if no stream is attached. Must be
    /// called within a Tokio runtime.
    #[must_use]
    pub fn stream(&self) -> SubscriptionStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();

        let (id, opening) = {
            let mut state = self.inner.state.lock();
            let id = state.next_consumer;
            state.next_consumer += 1;
            state.consumers.insert(id, tx);

            let opening = if state.session.is_none() {
                state.generation += 1;
                let (cancel, cancelled) = oneshot::channel();
                state.session = Some(Session {
                    generation: state.generation,
                    cancel,
                });
                state.lifecycle = SubscriptionState::Open;
                Some((state.generation, cancelled))
            } else {
                None
            };

            (id, opening)
        };

        if let Some((generation, cancelled)) = opening {
            debug!(operation = self.inner.operation, generation, "opening subscription");
            let pending = (self.inner.open)(Arc::downgrade(&self.inner), generation);
            tokio::spawn(run_session(
                Arc::downgrade(&self.inner),
                generation,
                pending,
                cancelled,
            ));
        }

        SubscriptionStream {
            rx: UnboundedReceiverStream::new(rx),
            id,
            shared: Arc::clone(&self.inner),
        }
    }

    /// Tear down the worker subscription and end every attached stream.
    pub fn cancel(&self) {
        let session = {
            let mut state = self.inner.state.lock();
            state.consumers.clear();
            let session = state.session.take();
            if session.is_some() {
                state.lifecycle.transition(SubscriptionState::Disposed);
            }
            session
        };
        if let Some(session) = session {
            debug!(operation = self.inner.operation, "subscription cancelled");
            session.end();
        }
    }

    /// Number of attached streams.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.inner.state.lock().consumers.len()
    }

    /// Lifecycle of the most recent worker subscription.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.inner.state.lock().lifecycle
    }
}

async fn run_session<T>(
    shared: Weak<SharedInner<T>>,
    generation: u64,
    pending: PendingSubscription,
    cancelled: oneshot::Receiver<()>,
) where
    T: Clone + Send + 'static,
{
    let disposer: RemoteDisposer = match pending.await {
        Ok(disposer) => disposer,
        Err(err) => {
            deliver(&shared, generation, Event::Error(err.into()));
            return;
        }
    };

    // resolves on cancel, teardown of the last stream, or a terminal event
    let _ = cancelled.await;
    if let Err(err) = disposer.dispose().await {
        debug!(%err, "dispose failed");
    }
}

/// One consumer of a shared subscription.
///
/// Yields `Ok` for each update; an `Err` is the last item. The stream ends
/// when the subscription completes or is cancelled.
pub struct SubscriptionStream<T> {
    rx: UnboundedReceiverStream<Item<T>>,
    id: u64,
    shared: Arc<SharedInner<T>>,
}

impl<T> Stream for SubscriptionStream<T> {
    type Item = Item<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl<T> Drop for SubscriptionStream<T> {
    fn drop(&mut self) {
        let session = {
            let mut state = self.shared.state.lock();
            if state.consumers.remove(&self.id).is_none() || !state.consumers.is_empty() {
                return;
            }
            let session = state.session.take();
            if session.is_some() {
                state.lifecycle.transition(SubscriptionState::Disposed);
            }
            session
        };
        if let Some(session) = session {
            debug!(operation = self.shared.operation, "last consumer detached");
            session.end();
        }
    }
}

impl<T> fmt::Debug for SubscriptionStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionStream")
            .field("operation", &self.shared.operation)
            .field("consumer", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use portlink_core::ClientId;
    use portlink_transport::{Remote, port};

    use super::*;

    struct Untyped;

    #[tokio::test]
    async fn views_format_without_a_contract() {
        let (client, _worker) = port::channel();
        let proxy = DispatchProxy::<Untyped>::new(Remote::wrap(client), ClientId::new("c1"));
        assert!(proxy.is_connected());

        let subscriptions = Subscriptions::new(proxy.clone());
        assert!(format!("{subscriptions:?}").contains("c1"));
        assert!(format!("{proxy:?}").contains("c1"));
    }
}
