//! Named exclusive locks shared by every endpoint of one worker.
//!
//! A client holds the lock named after its id for as long as it lives.
//! The worker queues on the same name and treats acquiring it as proof that
//! the client is gone. Waiters are granted the lock in request order, and a
//! request takes its place in the queue when it is made, not when it is
//! first polled.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, Waker},
};

use parking_lot::Mutex;
use tracing::trace;

/// Identifies one request for a lock, and the guard it turns into.
pub type LockTicket = u64;

struct Waiter {
    ticket: LockTicket,
    waker: Option<Waker>,
}

#[derive(Default)]
struct LockState {
    holder: Option<LockTicket>,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct Shared {
    locks: Mutex<HashMap<String, LockState>>,
    next_ticket: AtomicU64,
}

impl Shared {
    /// Hand `name` to the next waiter, or forget it if nobody waits.
    fn release(&self, name: &str, ticket: LockTicket) {
        let waker = {
            let mut locks = self.locks.lock();
            let Some(state) = locks.get_mut(name) else {
                return;
            };
            if state.holder != Some(ticket) {
                return;
            }
            match state.waiters.pop_front() {
                Some(next) => {
                    state.holder = Some(next.ticket);
                    next.waker
                }
                None => {
                    locks.remove(name);
                    None
                }
            }
        };
        trace!(lock = name, ticket, "lock released");
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Withdraw a request that was never turned into a guard.
    fn withdraw(&self, name: &str, ticket: LockTicket) {
        {
            let mut locks = self.locks.lock();
            let Some(state) = locks.get_mut(name) else {
                return;
            };
            if state.holder != Some(ticket) {
                state.waiters.retain(|waiter| waiter.ticket != ticket);
                if state.holder.is_none() && state.waiters.is_empty() {
                    locks.remove(name);
                }
                return;
            }
        }
        // granted but never polled
        self.release(name, ticket);
    }
}

/// Registry of named locks.
#[derive(Clone, Default)]
pub struct LockManager {
    shared: Arc<Shared>,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the queue for the lock called `name`.
    ///
    /// The place in the queue is taken before this returns; the returned
    /// future resolves once every earlier request has released the lock.
    /// Dropping the request gives up its place.
    pub fn request(&self, name: &str) -> LockRequest {
        let ticket = self.shared.next_ticket.fetch_add(1, Ordering::Relaxed);
        {
            let mut locks = self.shared.locks.lock();
            let state = locks.entry(name.to_string()).or_default();
            if state.holder.is_none() && state.waiters.is_empty() {
                state.holder = Some(ticket);
            } else {
                state.waiters.push_back(Waiter {
                    ticket,
                    waker: None,
                });
            }
        }
        trace!(lock = name, ticket, "lock requested");

        LockRequest {
            name: name.to_string(),
            ticket,
            shared: Arc::clone(&self.shared),
            done: false,
        }
    }

    /// Wait for the lock called `name`.
    pub async fn acquire(&self, name: &str) -> LockGuard {
        self.request(name).await
    }

    /// Take the lock called `name` if nobody holds or waits on it.
    #[must_use]
    pub fn try_acquire(&self, name: &str) -> Option<LockGuard> {
        let ticket = {
            let mut locks = self.shared.locks.lock();
            if locks.contains_key(name) {
                return None;
            }
            let ticket = self.shared.next_ticket.fetch_add(1, Ordering::Relaxed);
            locks.insert(
                name.to_string(),
                LockState {
                    holder: Some(ticket),
                    waiters: VecDeque::new(),
                },
            );
            ticket
        };
        Some(LockGuard {
            name: name.to_string(),
            ticket,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Ticket of the current holder of the lock called `name`.
    #[must_use]
    pub fn holder(&self, name: &str) -> Option<LockTicket> {
        self.shared
            .locks
            .lock()
            .get(name)
            .and_then(|state| state.holder)
    }

    /// Whether someone currently holds the lock called `name`.
    #[must_use]
    pub fn is_held(&self, name: &str) -> bool {
        self.holder(name).is_some()
    }

    /// Number of requests queued behind the holder of `name`.
    #[must_use]
    pub fn waiting(&self, name: &str) -> usize {
        self.shared
            .locks
            .lock()
            .get(name)
            .map_or(0, |state| state.waiters.len())
    }

    /// Number of names with a holder or a waiter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.locks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("locks", &self.len())
            .finish()
    }
}

/// Queued request for a lock. Resolves to the guard.
#[must_use = "dropping the request gives up its place in the queue"]
pub struct LockRequest {
    name: String,
    ticket: LockTicket,
    shared: Arc<Shared>,
    done: bool,
}

impl LockRequest {
    #[must_use]
    pub const fn ticket(&self) -> LockTicket {
        self.ticket
    }
}

impl Future for LockRequest {
    type Output = LockGuard;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        {
            let mut locks = this.shared.locks.lock();
            let Some(state) = locks.get_mut(&this.name) else {
                return Poll::Pending;
            };
            if state.holder != Some(this.ticket) {
                if let Some(waiter) = state
                    .waiters
                    .iter_mut()
                    .find(|waiter| waiter.ticket == this.ticket)
                {
                    waiter.waker = Some(cx.waker().clone());
                }
                return Poll::Pending;
            }
        }

        this.done = true;
        trace!(lock = %this.name, ticket = this.ticket, "lock acquired");
        Poll::Ready(LockGuard {
            name: this.name.clone(),
            ticket: this.ticket,
            shared: Arc::clone(&this.shared),
        })
    }
}

impl Drop for LockRequest {
    fn drop(&mut self) {
        if !self.done {
            self.shared.withdraw(&self.name, self.ticket);
        }
    }
}

impl fmt::Debug for LockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRequest")
            .field("name", &self.name)
            .field("ticket", &self.ticket)
            .finish()
    }
}

/// Held lock. Dropping it lets the next waiter in.
pub struct LockGuard {
    name: String,
    ticket: LockTicket,
    shared: Arc<Shared>,
}

impl LockGuard {
    /// Name of the lock.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn ticket(&self) -> LockTicket {
        self.ticket
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.shared.release(&self.name, self.ticket);
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("ticket", &self.ticket)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    #[tokio::test]
    async fn waiter_acquires_after_release() {
        let locks = LockManager::new();
        let held = locks.acquire("c1").await;
        assert!(locks.is_held("c1"));

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("c1").await.name().to_string() })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap(), "c1");
        assert!(!locks.is_held("c1"));
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn names_are_independent() {
        let locks = LockManager::new();
        let _a = locks.acquire("a").await;
        assert!(locks.try_acquire("b").is_some());
        assert!(locks.try_acquire("a").is_none());
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn queue_order_is_fixed_at_request_time() {
        let locks = LockManager::new();
        let held = locks.try_acquire("c1").unwrap();

        // neither request is polled before the holder leaves
        let mut first = task::spawn(locks.request("c1"));
        let mut second = task::spawn(locks.request("c1"));
        assert_eq!(locks.waiting("c1"), 2);
        assert_pending!(second.poll());

        drop(held);
        assert_eq!(locks.holder("c1"), Some(first.ticket()));
        assert_pending!(second.poll());

        let guard = assert_ready!(first.poll());
        drop(guard);
        assert!(second.is_woken());
        let guard = assert_ready!(second.poll());
        assert_eq!(locks.holder("c1"), Some(guard.ticket()));

        drop(guard);
        assert!(locks.is_empty());
    }

    #[test]
    fn dropped_requests_give_up_their_place() {
        let locks = LockManager::new();
        let held = locks.try_acquire("c1").unwrap();

        let queued = locks.request("c1");
        let granted = locks.request("c1");
        let mut last = task::spawn(locks.request("c1"));

        drop(queued);
        drop(held);
        assert_eq!(locks.holder("c1"), Some(granted.ticket()));

        // granted but never polled: the lock moves on
        drop(granted);
        assert_eq!(locks.holder("c1"), Some(last.ticket()));
        let guard = assert_ready!(last.poll());
        drop(guard);
        assert!(locks.is_empty());
    }
}
