//! Client endpoint of a port.
//!
//! `Remote` turns a `ClientPort` into a call interface: every invocation
//! gets a request id and a pending reply slot, and function arguments are
//! kept in a local callback table while the worker holds handles to them.
//!
//! Callback deliveries addressed to a request that has not been answered
//! yet are held back and released, in arrival order, right after the reply
//! is delivered.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use parking_lot::Mutex;
use portlink_core::RemoteError;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::{
    TransportError,
    port::ClientPort,
    protocol::{ClientMessage, HandleId, RequestId, ServerMessage, WireArg, WireReturn},
};

/// Function that can be handed to the other side of the channel.
pub type LocalFn = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Outgoing argument.
pub enum Arg {
    /// Plain value.
    Value(Value),
    /// Function exposed to the worker as a callback handle.
    Function(LocalFn),
}

impl Arg {
    /// Wrap a closure as a function argument.
    #[must_use]
    pub fn function(f: impl Fn(Vec<Value>) + Send + Sync + 'static) -> Self {
        Self::Function(Arc::new(f))
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Function(_) => f.write_str("Function"),
        }
    }
}

/// Successful reply.
#[derive(Debug)]
pub enum Returned {
    /// Plain value.
    Value(Value),
    /// Function living in the worker.
    Function(RemoteFunction),
}

struct Pending {
    reply: oneshot::Sender<Result<Returned, RemoteError>>,
    callbacks: Vec<HandleId>,
    held: Vec<(HandleId, Vec<Value>)>,
}

struct CallbackSlot {
    callback: LocalFn,
    /// Request whose reply has not arrived yet.
    gate: Option<RequestId>,
    /// Worker released the handle while it was gated.
    released: bool,
}

struct Inner {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, Pending>>,
    callbacks: Mutex<HashMap<HandleId, CallbackSlot>>,
    closed: AtomicBool,
}

/// Call interface over a client port.
#[derive(Clone)]
pub struct Remote {
    inner: Arc<Inner>,
}

impl Remote {
    /// Wrap a port.
    ///
    /// Spawns the reply reader, so this must be called within a Tokio
    /// runtime.
    #[must_use]
    pub fn wrap(port: ClientPort) -> Self {
        let (outbound, inbound) = port.split();
        let inner = Arc::new(Inner {
            outbound,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(read_loop(Arc::downgrade(&inner), inbound));

        Self { inner }
    }

    /// Invoke a named operation.
    ///
    /// The message is sent before this returns, so invocations reach the
    /// worker in the order they were made. Function arguments are replaced
    /// by callback handles.
    pub fn invoke(&self, operation: &str, args: Vec<Arg>) -> PendingReply {
        let id = self.inner.next_id();
        let mut callbacks = Vec::new();

        let args = args
            .into_iter()
            .map(|arg| match arg {
                Arg::Value(value) => WireArg::Value { value },
                Arg::Function(callback) => {
                    let handle = self.inner.next_id();
                    self.inner.callbacks.lock().insert(
                        handle,
                        CallbackSlot {
                            callback,
                            gate: Some(id),
                            released: false,
                        },
                    );
                    callbacks.push(handle);
                    WireArg::Callback { handle }
                }
            })
            .collect();

        trace!(id, operation, "invoke");
        self.inner.send(
            id,
            callbacks,
            ClientMessage::Invoke {
                id,
                operation: operation.to_string(),
                args,
            },
        )
    }

    /// Whether the worker side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Number of callbacks the worker may still invoke.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.lock().len()
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, id: RequestId, callbacks: Vec<HandleId>, message: ClientMessage) -> PendingReply {
        let (reply, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            Pending {
                reply,
                callbacks,
                held: Vec::new(),
            },
        );

        if self.closed.load(Ordering::Acquire) || self.outbound.send(message).is_err() {
            let pending = self.pending.lock().remove(&id);
            if let Some(pending) = pending {
                self.forget_callbacks(&pending.callbacks);
            }
        }

        PendingReply { rx: Some(rx) }
    }

    fn forget_callbacks(&self, handles: &[HandleId]) {
        let removed: Vec<_> = {
            let mut callbacks = self.callbacks.lock();
            handles.iter().filter_map(|h| callbacks.remove(h)).collect()
        };
        drop(removed);
    }

    fn handle(self: &Arc<Self>, message: ServerMessage) {
        match message {
            ServerMessage::Reply { id, result } => self.on_reply(id, result),
            ServerMessage::Callback { handle, args } => self.on_callback(handle, args),
            ServerMessage::Release { handle } => self.on_release(handle),
        }
    }

    fn on_reply(self: &Arc<Self>, id: RequestId, result: Result<WireReturn, RemoteError>) {
        let pending = self.pending.lock().remove(&id);
        let Some(pending) = pending else {
            warn!(id, "reply for unknown request");
            return;
        };

        let result = result.map(|ret| match ret {
            WireReturn::Value { value } => Returned::Value(value),
            WireReturn::Handle { handle } => Returned::Function(RemoteFunction {
                handle,
                inner: Arc::downgrade(self),
            }),
        });
        let _ = pending.reply.send(result);

        let opened: HashMap<HandleId, LocalFn> = {
            let mut callbacks = self.callbacks.lock();
            let mut opened = HashMap::with_capacity(pending.callbacks.len());
            for handle in &pending.callbacks {
                let Some(slot) = callbacks.get_mut(handle) else {
                    continue;
                };
                slot.gate = None;
                opened.insert(*handle, Arc::clone(&slot.callback));
                if slot.released {
                    callbacks.remove(handle);
                }
            }
            opened
        };

        for (handle, args) in pending.held {
            if let Some(callback) = opened.get(&handle) {
                callback(args);
            }
        }
    }

    fn on_callback(&self, handle: HandleId, args: Vec<Value>) {
        let callback = {
            let mut callbacks = self.callbacks.lock();
            let Some(slot) = callbacks.get_mut(&handle) else {
                debug!(handle, "callback for released handle");
                return;
            };
            if let Some(request) = slot.gate {
                if let Some(pending) = self.pending.lock().get_mut(&request) {
                    pending.held.push((handle, args));
                    return;
                }
                slot.gate = None;
            }
            Arc::clone(&slot.callback)
        };
        callback(args);
    }

    fn on_release(&self, handle: HandleId) {
        let removed = {
            let mut callbacks = self.callbacks.lock();
            match callbacks.get_mut(&handle) {
                Some(slot) if slot.gate.is_some() => {
                    slot.released = true;
                    None
                }
                Some(_) => callbacks.remove(&handle),
                None => None,
            }
        };
        drop(removed);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let pending: Vec<_> = self.pending.lock().drain().collect();
        let callbacks: Vec<_> = self.callbacks.lock().drain().collect();
        debug!(
            pending = pending.len(),
            callbacks = callbacks.len(),
            "client port closed"
        );
    }
}

async fn read_loop(inner: Weak<Inner>, mut inbound: mpsc::UnboundedReceiver<ServerMessage>) {
    while let Some(message) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle(message);
    }

    if let Some(inner) = inner.upgrade() {
        inner.close();
    }
}

/// Handle to a function living in the worker.
///
/// Dropping the handle tells the worker to forget the function.
pub struct RemoteFunction {
    handle: HandleId,
    inner: Weak<Inner>,
}

impl RemoteFunction {
    /// Handle id.
    #[must_use]
    pub const fn handle(&self) -> HandleId {
        self.handle
    }

    /// Call the function in the worker.
    pub fn apply(&self, args: Vec<Value>) -> PendingReply {
        let Some(inner) = self.inner.upgrade() else {
            return PendingReply::closed();
        };
        let id = inner.next_id();
        inner.send(
            id,
            Vec::new(),
            ClientMessage::Apply {
                id,
                handle: self.handle,
                args,
            },
        )
    }
}

impl Drop for RemoteFunction {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let _ = inner.outbound.send(ClientMessage::Release {
                handle: self.handle,
            });
        }
    }
}

impl fmt::Debug for RemoteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFunction")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Reply that has not arrived yet.
#[must_use = "the reply is delivered through this future"]
pub struct PendingReply {
    rx: Option<oneshot::Receiver<Result<Returned, RemoteError>>>,
}

impl PendingReply {
    const fn closed() -> Self {
        Self { rx: None }
    }
}

impl Future for PendingReply {
    type Output = Result<Returned, TransportError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(TransportError::Closed));
        };

        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(Ok(returned))) => Poll::Ready(Ok(returned)),
            Poll::Ready(Ok(Err(error))) => Poll::Ready(Err(TransportError::Remote(error))),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;

    use super::*;
    use crate::{
        expose::{Exposed, Incoming, Reply, expose},
        port,
    };

    /// Echoes the first value and pushes every extra value to the first
    /// callback before replying.
    struct Echo;

    impl Exposed for Echo {
        fn dispatch(
            &self,
            operation: &str,
            args: Vec<Incoming>,
        ) -> BoxFuture<'static, Result<Reply, RemoteError>> {
            let operation = operation.to_string();
            Box::pin(async move {
                let mut values = Vec::new();
                let mut callback = None;
                for arg in args {
                    match arg {
                        Incoming::Value(value) => values.push(value),
                        Incoming::Callback(remote) => callback = callback.or(Some(remote)),
                    }
                }
                match operation.as_str() {
                    "echo" => Ok(Reply::Value(values.remove(0))),
                    "push" => {
                        let callback = callback.ok_or_else(|| RemoteError::handler("no callback"))?;
                        for value in values {
                            callback.invoke(vec![value]);
                        }
                        Ok(Reply::Function(Arc::new(|_: Vec<Value>| {})))
                    }
                    _ => Err(RemoteError::unknown_operation(&operation)),
                }
            })
        }
    }

    fn connect() -> Remote {
        let (client, worker) = port::channel();
        expose(Arc::new(Echo), worker);
        Remote::wrap(client)
    }

    #[tokio::test]
    async fn value_reply() {
        let remote = connect();
        let reply = remote.invoke("echo", vec![Arg::Value(Value::from("hi"))]).await;
        match reply {
            Ok(Returned::Value(value)) => assert_eq!(value, Value::from("hi")),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(remote.pending_count(), 0);
    }

    #[tokio::test]
    async fn rejected_reply() {
        let remote = connect();
        let err = remote.invoke("missing", Vec::new()).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Remote(RemoteError::unknown_operation("missing"))
        );
    }

    #[tokio::test]
    async fn callbacks_held_until_reply() {
        let remote = connect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let reply = remote.invoke(
            "push",
            vec![
                Arg::function(move |args| sink.lock().extend(args)),
                Arg::Value(Value::from(1)),
                Arg::Value(Value::from(2)),
            ],
        );
        let returned = reply.await.unwrap();
        assert!(matches!(returned, Returned::Function(_)));
        assert_eq!(*seen.lock(), vec![Value::from(1), Value::from(2)]);

        // the worker dropped its callback handle when the handler finished
        assert_eq!(remote.callback_count(), 0);
    }

    #[tokio::test]
    async fn closed_port_fails_pending_calls() {
        let (client, worker) = port::channel();
        let remote = Remote::wrap(client);
        drop(worker);

        let err = remote.invoke("echo", Vec::new()).await.unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }
}
