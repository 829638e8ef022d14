//! Multicast push sources.
//!
//! A source keeps a broadcast list of observers keyed by a monotonically
//! increasing id, so attaching and detaching are O(1). Observers are always
//! invoked outside the source's lock; an observer may detach itself (or
//! others) from inside a callback.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::{Disposer, RemoteError};

type NextFn<T> = Box<dyn Fn(T) + Send + Sync>;
type ErrorFn = Box<dyn Fn(RemoteError) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;

/// Callback triple attached to a source.
pub struct Observer<T> {
    next: NextFn<T>,
    error: ErrorFn,
    complete: CompleteFn,
}

impl<T> Observer<T> {
    /// Create an observer from all three callbacks.
    #[must_use]
    pub fn new(
        next: impl Fn(T) + Send + Sync + 'static,
        error: impl Fn(RemoteError) + Send + Sync + 'static,
        complete: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            next: Box::new(next),
            error: Box::new(error),
            complete: Box::new(complete),
        }
    }

    /// Create an observer that ignores errors and completion.
    #[must_use]
    pub fn from_next(next: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::new(next, |_: RemoteError| {}, || {})
    }

    /// Deliver a value.
    pub fn next(&self, value: T) {
        (self.next)(value);
    }

    /// Deliver an error.
    pub fn error(&self, error: RemoteError) {
        (self.error)(error);
    }

    /// Deliver completion.
    pub fn complete(&self) {
        (self.complete)();
    }
}

impl<T> fmt::Debug for Observer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer").finish_non_exhaustive()
    }
}

/// Handle to an attached observer.
///
/// `unsubscribe` is idempotent; dropping the handle unsubscribes.
#[derive(Debug)]
pub struct SourceSubscription(Disposer);

impl SourceSubscription {
    /// Create a handle from a detach function.
    #[must_use]
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self(Disposer::new(teardown))
    }

    /// A handle with nothing attached.
    #[must_use]
    pub fn closed() -> Self {
        Self(Disposer::noop())
    }

    /// Detach the observer.
    pub fn unsubscribe(&self) {
        self.0.dispose();
    }

    /// Whether the observer was already detached.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.is_disposed()
    }
}

impl Drop for SourceSubscription {
    fn drop(&mut self) {
        self.0.dispose();
    }
}

/// A multicast origin of values.
pub trait PushSource<T>: Send + Sync {
    /// Attach an observer.
    fn attach(&self, observer: Observer<T>) -> SourceSubscription;

    /// Number of currently attached observers.
    fn observer_count(&self) -> usize;

    /// Whether at least one observer is attached.
    fn has_observers(&self) -> bool {
        self.observer_count() > 0
    }
}

/// A source that values can be pushed into.
pub trait Publisher<T>: PushSource<T> {
    /// Push a value to every attached observer.
    fn publish(&self, value: T);
}

#[derive(Debug, Clone)]
enum Terminal {
    Completed,
    Errored(RemoteError),
}

struct SubjectState<T> {
    observers: HashMap<u64, Arc<Observer<T>>>,
    next_id: u64,
    terminal: Option<Terminal>,
}

/// Plain multicast source.
///
/// After `error` or `complete` the subject is terminal: further values are
/// dropped and late observers receive the terminal event immediately.
pub struct Subject<T> {
    state: Arc<Mutex<SubjectState<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Subject<T> {
    /// Create a subject with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SubjectState {
                observers: HashMap::new(),
                next_id: 0,
                terminal: None,
            })),
        }
    }

    /// Whether `error` or `complete` has been called.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    /// Terminate with an error.
    pub fn error(&self, error: RemoteError) {
        for observer in self.terminate(Terminal::Errored(error.clone())) {
            observer.error(error.clone());
        }
    }

    /// Terminate normally.
    pub fn complete(&self) {
        for observer in self.terminate(Terminal::Completed) {
            observer.complete();
        }
    }

    fn terminate(&self, terminal: Terminal) -> Vec<Arc<Observer<T>>> {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return Vec::new();
        }
        state.terminal = Some(terminal);
        state.observers.drain().map(|(_, observer)| observer).collect()
    }

    fn attach_shared(&self, observer: Arc<Observer<T>>) -> SourceSubscription {
        let mut state = self.state.lock();
        if let Some(terminal) = state.terminal.clone() {
            drop(state);
            match terminal {
                Terminal::Completed => observer.complete(),
                Terminal::Errored(error) => observer.error(error),
            }
            return SourceSubscription::closed();
        }

        let id = state.next_id;
        state.next_id += 1;
        state.observers.insert(id, observer);
        drop(state);

        let weak: Weak<Mutex<SubjectState<T>>> = Arc::downgrade(&self.state);
        SourceSubscription::new(move || {
            if let Some(state) = weak.upgrade() {
                let removed = state.lock().observers.remove(&id);
                drop(removed);
            }
        })
    }
}

impl<T: Clone + Send + 'static> Subject<T> {
    /// Push a value to every attached observer.
    pub fn next(&self, value: T) {
        let observers: Vec<_> = {
            let state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.observers.values().cloned().collect()
        };
        for observer in observers {
            observer.next(value.clone());
        }
    }
}

impl<T: Send + 'static> PushSource<T> for Subject<T> {
    fn attach(&self, observer: Observer<T>) -> SourceSubscription {
        self.attach_shared(Arc::new(observer))
    }

    fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }
}

impl<T: Clone + Send + 'static> Publisher<T> for Subject<T> {
    fn publish(&self, value: T) {
        self.next(value);
    }
}

/// Subject that remembers its latest value and replays it on attach.
pub struct BehaviorSubject<T> {
    subject: Subject<T>,
    current: Arc<Mutex<T>>,
}

impl<T> Clone for BehaviorSubject<T> {
    fn clone(&self) -> Self {
        Self {
            subject: self.subject.clone(),
            current: Arc::clone(&self.current),
        }
    }
}

impl<T: Clone + Send + 'static> BehaviorSubject<T> {
    /// Create with an initial value.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            subject: Subject::new(),
            current: Arc::new(Mutex::new(initial)),
        }
    }

    /// Latest value.
    #[must_use]
    pub fn value(&self) -> T {
        self.current.lock().clone()
    }

    /// Store and push a value.
    pub fn next(&self, value: T) {
        *self.current.lock() = value.clone();
        self.subject.next(value);
    }

    /// Terminate with an error.
    pub fn error(&self, error: RemoteError) {
        self.subject.error(error);
    }

    /// Terminate normally.
    pub fn complete(&self) {
        self.subject.complete();
    }
}

impl<T: Clone + Send + 'static> PushSource<T> for BehaviorSubject<T> {
    fn attach(&self, observer: Observer<T>) -> SourceSubscription {
        let observer = Arc::new(observer);
        if !self.subject.is_terminal() {
            observer.next(self.value());
        }
        self.subject.attach_shared(observer)
    }

    fn observer_count(&self) -> usize {
        self.subject.observer_count()
    }
}

impl<T: Clone + Send + 'static> Publisher<T> for BehaviorSubject<T> {
    fn publish(&self, value: T) {
        self.next(value);
    }
}

type Connect<U> = Arc<dyn Fn(Subject<U>) -> SourceSubscription + Send + Sync>;

#[derive(Default)]
struct Upstream {
    connected: bool,
    handle: Option<SourceSubscription>,
}

/// Derived source sharing one upstream attachment among its observers.
///
/// The upstream is attached when the first observer arrives and detached
/// when the last one leaves.
pub struct Shared<U> {
    subject: Subject<U>,
    connect: Connect<U>,
    upstream: Arc<Mutex<Upstream>>,
}

impl<U> Clone for Shared<U> {
    fn clone(&self) -> Self {
        Self {
            subject: self.subject.clone(),
            connect: Arc::clone(&self.connect),
            upstream: Arc::clone(&self.upstream),
        }
    }
}

impl<U: Clone + Send + 'static> PushSource<U> for Shared<U> {
    fn attach(&self, observer: Observer<U>) -> SourceSubscription {
        let downstream = self.subject.attach(observer);

        let should_connect = {
            let mut upstream = self.upstream.lock();
            let connect = !upstream.connected && !self.subject.is_terminal();
            if connect {
                upstream.connected = true;
            }
            connect
        };

        if should_connect {
            let handle = (self.connect)(self.subject.clone());
            let stale = {
                let mut upstream = self.upstream.lock();
                if upstream.connected && upstream.handle.is_none() {
                    upstream.handle = Some(handle);
                    None
                } else {
                    Some(handle)
                }
            };
            drop(stale);
        }

        let subject = self.subject.clone();
        let upstream = Arc::clone(&self.upstream);
        SourceSubscription::new(move || {
            downstream.unsubscribe();
            if subject.observer_count() == 0 {
                let handle = {
                    let mut upstream = upstream.lock();
                    upstream.connected = false;
                    upstream.handle.take()
                };
                drop(handle);
            }
        })
    }

    fn observer_count(&self) -> usize {
        self.subject.observer_count()
    }
}

/// Operators over push sources.
pub trait SourceExt<T>: PushSource<T> + Sized + 'static {
    /// Map every value and share the upstream attachment.
    fn map_shared<U, F>(self, f: F) -> Shared<U>
    where
        T: 'static,
        U: Clone + Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let connect = move |subject: Subject<U>| {
            let f = Arc::clone(&f);
            let on_error = subject.clone();
            let on_complete = subject.clone();
            self.attach(Observer::new(
                move |value| subject.next(f(value)),
                move |error| on_error.error(error),
                move || on_complete.complete(),
            ))
        };

        Shared {
            subject: Subject::new(),
            connect: Arc::new(connect),
            upstream: Arc::default(),
        }
    }
}

impl<T, S> SourceExt<T> for S where S: PushSource<T> + Sized + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder<T: Send + 'static>() -> (Observer<T>, Arc<Mutex<Vec<String>>>)
    where
        T: fmt::Debug,
    {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (next, error, complete) = (
            Arc::clone(&events),
            Arc::clone(&events),
            Arc::clone(&events),
        );
        let observer = Observer::new(
            move |value: T| next.lock().push(format!("next:{value:?}")),
            move |err: RemoteError| error.lock().push(format!("error:{}", err.message)),
            move || complete.lock().push("complete".to_string()),
        );
        (observer, events)
    }

    #[test]
    fn subject_fans_out_to_every_observer() {
        let subject = Subject::new();
        let (a, a_events) = recorder::<u32>();
        let (b, b_events) = recorder::<u32>();
        let _a = subject.attach(a);
        let _b = subject.attach(b);
        assert_eq!(subject.observer_count(), 2);

        subject.next(1);
        subject.next(2);

        assert_eq!(*a_events.lock(), vec!["next:1", "next:2"]);
        assert_eq!(*b_events.lock(), vec!["next:1", "next:2"]);
    }

    #[test]
    fn unsubscribe_detaches_only_that_observer() {
        let subject = Subject::new();
        let (a, a_events) = recorder::<u32>();
        let (b, b_events) = recorder::<u32>();
        let a = subject.attach(a);
        let _b = subject.attach(b);

        a.unsubscribe();
        a.unsubscribe();
        assert!(a.is_closed());
        subject.next(7);

        assert!(a_events.lock().is_empty());
        assert_eq!(*b_events.lock(), vec!["next:7"]);
        assert_eq!(subject.observer_count(), 1);
    }

    #[test]
    fn dropping_the_handle_detaches() {
        let subject = Subject::<u32>::new();
        let (observer, _events) = recorder::<u32>();
        drop(subject.attach(observer));
        assert!(!subject.has_observers());
    }

    #[test]
    fn error_is_terminal() {
        let subject = Subject::new();
        let (observer, events) = recorder::<u32>();
        let _handle = subject.attach(observer);

        subject.error(RemoteError::source("boom"));
        subject.next(1);
        subject.complete();

        assert_eq!(*events.lock(), vec!["error:boom"]);
        assert!(subject.is_terminal());
        assert_eq!(subject.observer_count(), 0);

        let (late, late_events) = recorder::<u32>();
        let handle = subject.attach(late);
        assert!(handle.is_closed());
        assert_eq!(*late_events.lock(), vec!["error:boom"]);
    }

    #[test]
    fn observer_can_detach_itself_while_notified() {
        let subject = Subject::new();
        let slot: Arc<Mutex<Option<SourceSubscription>>> = Arc::default();
        let seen = Arc::new(Mutex::new(0));

        let (inner_slot, inner_seen) = (Arc::clone(&slot), Arc::clone(&seen));
        let handle = subject.attach(Observer::from_next(move |_: u32| {
            *inner_seen.lock() += 1;
            let handle = inner_slot.lock().take();
            drop(handle);
        }));
        *slot.lock() = Some(handle);

        subject.next(1);
        subject.next(2);
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn behavior_subject_replays_current_value() {
        let subject = BehaviorSubject::new("alice".to_string());
        subject.next("bob".to_string());

        let (observer, events) = recorder::<String>();
        let _handle = subject.attach(observer);
        subject.next("carol".to_string());

        assert_eq!(*events.lock(), vec!["next:\"bob\"", "next:\"carol\""]);
        assert_eq!(subject.value(), "carol");
    }

    #[test]
    fn shared_map_attaches_upstream_once() {
        let upstream = Subject::<u32>::new();
        let doubled = upstream.clone().map_shared(|v: u32| v * 2);
        assert_eq!(upstream.observer_count(), 0);

        let (a, a_events) = recorder::<u32>();
        let (b, b_events) = recorder::<u32>();
        let a = doubled.attach(a);
        let b = doubled.attach(b);
        assert_eq!(upstream.observer_count(), 1);
        assert_eq!(doubled.observer_count(), 2);

        upstream.next(21);
        assert_eq!(*a_events.lock(), vec!["next:42"]);
        assert_eq!(*b_events.lock(), vec!["next:42"]);

        drop(a);
        assert_eq!(upstream.observer_count(), 1);
        drop(b);
        assert_eq!(upstream.observer_count(), 0);

        let (c, c_events) = recorder::<u32>();
        let _c = doubled.attach(c);
        assert_eq!(upstream.observer_count(), 1);
        upstream.next(1);
        assert_eq!(*c_events.lock(), vec!["next:2"]);
    }

    #[test]
    fn shared_map_forwards_completion() {
        let upstream = Subject::<u32>::new();
        let mapped = upstream.clone().map_shared(|v: u32| v + 1);
        let (observer, events) = recorder::<u32>();
        let _handle = mapped.attach(observer);

        upstream.complete();
        assert_eq!(*events.lock(), vec!["complete"]);
    }
}
