//! Client callbacks as seen by a subscription handler.

use std::{fmt, marker::PhantomData, sync::Arc};

use portlink_core::{RemoteError, value};
use portlink_transport::RemoteFn;
use serde::Serialize;
use tracing::warn;

/// The three delivery callbacks a client passed to a subscription.
///
/// Each method returns `false` once the client end is gone.
pub struct RemoteObserver<T> {
    on_next: Arc<RemoteFn>,
    on_error: Arc<RemoteFn>,
    on_complete: Arc<RemoteFn>,
    _update: PhantomData<fn(T)>,
}

impl<T> Clone for RemoteObserver<T> {
    fn clone(&self) -> Self {
        Self {
            on_next: Arc::clone(&self.on_next),
            on_error: Arc::clone(&self.on_error),
            on_complete: Arc::clone(&self.on_complete),
            _update: PhantomData,
        }
    }
}

impl<T: Serialize> RemoteObserver<T> {
    #[must_use]
    pub fn new(on_next: RemoteFn, on_error: RemoteFn, on_complete: RemoteFn) -> Self {
        Self {
            on_next: Arc::new(on_next),
            on_error: Arc::new(on_error),
            on_complete: Arc::new(on_complete),
            _update: PhantomData,
        }
    }

    /// Deliver a value.
    ///
    /// A value that cannot be encoded is reported through `error` instead.
    pub fn next(&self, update: &T) -> bool {
        match value::encode(update) {
            Ok(encoded) => self.on_next.invoke(vec![encoded]),
            Err(err) => {
                warn!(handle = self.on_next.handle(), %err, "update failed to encode");
                self.error(&RemoteError::invalid_payload(err.to_string()))
            }
        }
    }

    /// Deliver an error.
    pub fn error(&self, error: &RemoteError) -> bool {
        match value::encode(error) {
            Ok(encoded) => self.on_error.invoke(vec![encoded]),
            Err(_) => false,
        }
    }

    /// Deliver completion.
    pub fn complete(&self) -> bool {
        self.on_complete.invoke(Vec::new())
    }
}

impl<T> fmt::Debug for RemoteObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObserver")
            .field("on_next", &self.on_next.handle())
            .field("on_error", &self.on_error.handle())
            .field("on_complete", &self.on_complete.handle())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use portlink_transport::protocol::ServerMessage;
    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::*;

    /// Observer whose callbacks land in a local queue as
    /// `(handle, args)` pairs; handles are 1 (next), 2 (error), 3 (complete).
    pub(crate) fn observer<T: Serialize>() -> (RemoteObserver<T>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = RemoteObserver::new(
            RemoteFn::new(1, tx.clone()),
            RemoteFn::new(2, tx.clone()),
            RemoteFn::new(3, tx),
        );
        (observer, rx)
    }

    /// Drain pending callback deliveries, skipping releases.
    pub(crate) fn deliveries(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<(u64, Vec<Value>)> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let ServerMessage::Callback { handle, args } = message {
                out.push((handle, args));
            }
        }
        out
    }
}
