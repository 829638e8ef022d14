//! Subscription adapter on the worker side.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use portlink_core::{
    ClientId, Disposer, Observer, Publisher, PushSource, RemoteError, SourceSubscription,
    SubscriptionState,
};
use serde::Serialize;
use tracing::{debug, trace};

use crate::{
    HandlerError, RemoteObserver,
    registry::{ClientRegistry, SubscriptionId, SubscriptionSet},
};

/// Services available to every handler.
#[derive(Debug, Clone, Default)]
pub struct WorkerContext {
    clients: ClientRegistry,
}

impl WorkerContext {
    #[must_use]
    pub const fn new(clients: ClientRegistry) -> Self {
        Self { clients }
    }

    /// The client registry.
    #[must_use]
    pub const fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Attach a client's callbacks to a push source.
    ///
    /// The subscription is recorded under the client, so it ends when the
    /// client goes away, when the returned disposer runs, or when the
    /// source errors or completes, whichever happens first. Values the
    /// source replays during attachment are delivered.
    ///
    /// # Errors
    /// Returns `HandlerError::UnknownClient` if the client has no record.
    pub fn subscribe<T, S>(
        &self,
        source: &S,
        client_id: &ClientId,
        observer: RemoteObserver<T>,
    ) -> Result<Disposer, HandlerError>
    where
        T: Serialize + Send + 'static,
        S: PushSource<T> + ?Sized,
    {
        let set = self.clients.require(client_id)?;
        let id = self.clients.next_subscription_id();
        let state = Arc::new(Mutex::new(SubscriptionState::Open));
        let weak_set = Arc::downgrade(&set);

        let attached = source.attach(relay(observer, &state, &weak_set, id));
        let entry = {
            let state = Arc::clone(&state);
            SourceSubscription::new(move || {
                state.lock().transition(SubscriptionState::Disposed);
                attached.unsubscribe();
            })
        };

        if state.lock().is_terminal() {
            trace!(client_id = %client_id, subscription = id, "source ended during attach");
            return Ok(Disposer::noop());
        }

        if let Err(entry) = set.insert(id, entry) {
            drop(entry);
            return Err(HandlerError::UnknownClient(client_id.clone()));
        }

        // a terminal event may have raced the insert
        if state.lock().is_terminal() {
            drop(set.remove(id));
        }

        debug!(client_id = %client_id, subscription = id, "subscription opened");
        Ok(Disposer::new(move || remove_entry(&weak_set, id)))
    }

    /// Push `value` to `source` if anyone is listening, and return it.
    pub fn notify<T, S>(&self, source: &S, value: T) -> T
    where
        T: Clone,
        S: Publisher<T> + ?Sized,
    {
        if source.has_observers() {
            source.publish(value.clone());
        }
        value
    }
}

fn remove_entry(set: &Weak<SubscriptionSet>, id: SubscriptionId) {
    if let Some(set) = set.upgrade() {
        drop(set.remove(id));
    }
}

fn relay<T>(
    observer: RemoteObserver<T>,
    state: &Arc<Mutex<SubscriptionState>>,
    set: &Weak<SubscriptionSet>,
    id: SubscriptionId,
) -> Observer<T>
where
    T: Serialize + Send + 'static,
{
    let next = {
        let observer = observer.clone();
        let state = Arc::clone(state);
        move |value: T| {
            if state.lock().is_open() {
                observer.next(&value);
            }
        }
    };

    let error = {
        let observer = observer.clone();
        let state = Arc::clone(state);
        let set = set.clone();
        move |error: RemoteError| {
            if state.lock().transition(SubscriptionState::Errored) {
                observer.error(&error);
                remove_entry(&set, id);
            }
        }
    };

    let complete = {
        let state = Arc::clone(state);
        let set = set.clone();
        move || {
            if state.lock().transition(SubscriptionState::Completed) {
                observer.complete();
                remove_entry(&set, id);
            }
        }
    };

    Observer::new(next, error, complete)
}

#[cfg(test)]
mod tests {
    use portlink_core::{BehaviorSubject, Subject};
    use serde_json::{Value, json};

    use super::*;
    use crate::observer::testing::{deliveries, observer};

    async fn registered(id: &str) -> (WorkerContext, ClientId, portlink_transport::LockGuard) {
        let context = WorkerContext::default();
        let client_id = ClientId::new(id);
        let lease = context.clients().locks().acquire(id).await;
        context.clients().register(&client_id);
        (context, client_id, lease)
    }

    #[tokio::test]
    async fn unknown_client_cannot_subscribe() {
        let context = WorkerContext::default();
        let source = Subject::<u32>::new();
        let (obs, _rx) = observer();

        let err = tokio_test::assert_err!(context.subscribe(&source, &ClientId::new("c1"), obs));
        assert!(matches!(err, HandlerError::UnknownClient(_)));
        assert!(!source.has_observers());
    }

    #[tokio::test]
    async fn notify_reaches_subscribers_until_disposed() {
        let (context, id, _lease) = registered("c1").await;
        let source = Subject::<String>::new();
        let (obs, mut rx) = observer();

        // unobserved sources are skipped but the value is still returned
        assert_eq!(context.notify(&source, "early".to_string()), "early");

        let disposer = tokio_test::assert_ok!(context.subscribe(&source, &id, obs));
        assert_eq!(context.clients().subscription_count(&id), 1);
        context.notify(&source, "x".to_string());
        assert_eq!(deliveries(&mut rx), vec![(1, vec![json!("x")])]);

        assert!(disposer.dispose());
        assert!(!disposer.dispose());
        assert_eq!(context.clients().subscription_count(&id), 0);
        assert!(!source.has_observers());

        context.notify(&source, "y".to_string());
        assert!(deliveries(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn replayed_value_is_delivered() {
        let (context, id, _lease) = registered("c1").await;
        let profile = BehaviorSubject::new(json!({ "name": "Ada" }));
        let (obs, mut rx) = observer::<Value>();

        let _disposer = tokio_test::assert_ok!(context.subscribe(&profile, &id, obs));
        assert_eq!(deliveries(&mut rx), vec![(1, vec![json!({ "name": "Ada" })])]);
    }

    #[tokio::test]
    async fn terminal_events_remove_the_entry() {
        let (context, id, _lease) = registered("c1").await;
        let source = Subject::<u32>::new();
        let (obs, mut rx) = observer();

        let disposer = tokio_test::assert_ok!(context.subscribe(&source, &id, obs));
        source.error(RemoteError::source("boom"));
        assert_eq!(context.clients().subscription_count(&id), 0);

        let delivered = deliveries(&mut rx);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, 2);

        // disposing after the terminal event is a no-op for the source
        disposer.dispose();
        assert!(!source.has_observers());
    }

    #[tokio::test]
    async fn ended_source_yields_noop_disposer() {
        let (context, id, _lease) = registered("c1").await;
        let source = Subject::<u32>::new();
        source.complete();
        let (obs, mut rx) = observer();

        let disposer = tokio_test::assert_ok!(context.subscribe(&source, &id, obs));
        assert!(disposer.is_disposed());
        assert_eq!(context.clients().subscription_count(&id), 0);
        assert_eq!(deliveries(&mut rx), vec![(3, Vec::new())]);
    }

    #[tokio::test]
    async fn deregistration_tears_down_and_disposer_becomes_noop() {
        let (context, id, _lease) = registered("c1").await;
        let source = Subject::<u32>::new();
        let (first, _rx1) = observer();
        let (second, _rx2) = observer();

        let disposer = tokio_test::assert_ok!(context.subscribe(&source, &id, first));
        let _other = tokio_test::assert_ok!(context.subscribe(&source, &id, second));
        assert_eq!(source.observer_count(), 2);

        assert!(context.clients().deregister(&id));
        assert_eq!(source.observer_count(), 0);
        assert!(disposer.dispose());
    }
}
