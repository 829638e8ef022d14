//! Worker endpoint of a port.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use portlink_core::RemoteError;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, trace};

use crate::{
    port::WorkerPort,
    protocol::{ClientMessage, HandleId, RequestId, ServerMessage, WireArg, WireReturn},
    remote::LocalFn,
};

/// Argument as received by the worker.
#[derive(Debug)]
pub enum Incoming {
    /// Plain value.
    Value(Value),
    /// Callback living in the client.
    Callback(RemoteFn),
}

impl Incoming {
    /// The value, if this is one.
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Callback(_) => None,
        }
    }

    /// The callback, if this is one.
    #[must_use]
    pub fn into_callback(self) -> Option<RemoteFn> {
        match self {
            Self::Callback(callback) => Some(callback),
            Self::Value(_) => None,
        }
    }
}

/// Callback living in the client.
///
/// Dropping it releases the handle on the client side.
pub struct RemoteFn {
    handle: HandleId,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl RemoteFn {
    /// Create a callback bound to a client handle.
    #[must_use]
    pub const fn new(handle: HandleId, outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { handle, outbound }
    }

    /// Handle id.
    #[must_use]
    pub const fn handle(&self) -> HandleId {
        self.handle
    }

    /// Call the client function. Returns `false` once the client is gone.
    pub fn invoke(&self, args: Vec<Value>) -> bool {
        self.outbound
            .send(ServerMessage::Callback {
                handle: self.handle,
                args,
            })
            .is_ok()
    }
}

impl Drop for RemoteFn {
    fn drop(&mut self) {
        let _ = self.outbound.send(ServerMessage::Release {
            handle: self.handle,
        });
    }
}

impl fmt::Debug for RemoteFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFn")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Successful handler result.
pub enum Reply {
    /// Plain value.
    Value(Value),
    /// Function the client may call back later.
    Function(LocalFn),
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Function(_) => f.write_str("Function"),
        }
    }
}

/// Object whose operations are callable over a port.
pub trait Exposed: Send + Sync + 'static {
    /// Run a named operation.
    ///
    /// Called synchronously in message order; anything the operation must
    /// do before later messages are looked at happens here, the rest goes
    /// in the returned future.
    fn dispatch(
        &self,
        operation: &str,
        args: Vec<Incoming>,
    ) -> BoxFuture<'static, Result<Reply, RemoteError>>;
}

/// Serve `target` on `port` until the client end is dropped.
pub fn expose(target: Arc<dyn Exposed>, port: WorkerPort) -> JoinHandle<()> {
    tokio::spawn(serve(target, port))
}

pub(crate) async fn serve(target: Arc<dyn Exposed>, port: WorkerPort) {
    let (mut inbound, outbound) = port.split();
    let connection = Connection {
        target,
        outbound,
        handles: Arc::new(Mutex::new(HashMap::new())),
        next_handle: Arc::new(AtomicU64::new(1)),
    };

    while let Some(message) = inbound.recv().await {
        connection.handle(message);
    }

    debug!(
        handles = connection.handles.lock().len(),
        "worker port closed"
    );
}

struct Connection {
    target: Arc<dyn Exposed>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    handles: Arc<Mutex<HashMap<HandleId, LocalFn>>>,
    next_handle: Arc<AtomicU64>,
}

impl Connection {
    fn handle(&self, message: ClientMessage) {
        match message {
            ClientMessage::Invoke {
                id,
                operation,
                args,
            } => self.invoke(id, &operation, args),
            ClientMessage::Apply { id, handle, args } => self.apply(id, handle, args),
            ClientMessage::Release { handle } => {
                let removed = self.handles.lock().remove(&handle);
                if removed.is_none() {
                    trace!(handle, "release of unknown handle");
                }
            }
        }
    }

    fn invoke(&self, id: RequestId, operation: &str, args: Vec<WireArg>) {
        let args = args
            .into_iter()
            .map(|arg| match arg {
                WireArg::Value { value } => Incoming::Value(value),
                WireArg::Callback { handle } => {
                    Incoming::Callback(RemoteFn::new(handle, self.outbound.clone()))
                }
            })
            .collect();

        let dispatched =
            panic::catch_unwind(AssertUnwindSafe(|| self.target.dispatch(operation, args)));
        let future = match dispatched {
            Ok(future) => future,
            Err(payload) => {
                error!(operation, "handler panicked");
                let _ = self
                    .outbound
                    .send(ServerMessage::error(id, panicked(payload.as_ref())));
                return;
            }
        };

        let outbound = self.outbound.clone();
        let handles = Arc::clone(&self.handles);
        let next_handle = Arc::clone(&self.next_handle);
        let operation = operation.to_string();

        tokio::spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    error!(operation = %operation, "handler panicked");
                    Err(panicked(payload.as_ref()))
                }
            };

            let message = match result {
                Ok(Reply::Value(value)) => ServerMessage::value(id, value),
                Ok(Reply::Function(function)) => {
                    let handle = next_handle.fetch_add(1, Ordering::Relaxed);
                    handles.lock().insert(handle, function);
                    ServerMessage::Reply {
                        id,
                        result: Ok(WireReturn::Handle { handle }),
                    }
                }
                Err(err) => {
                    debug!(operation = %operation, code = %err.code, "operation rejected");
                    ServerMessage::error(id, err)
                }
            };

            if outbound.send(message).is_err() {
                debug!(operation = %operation, "client gone before reply");
            }
        });
    }

    fn apply(&self, id: RequestId, handle: HandleId, args: Vec<Value>) {
        let function = self.handles.lock().get(&handle).cloned();
        let message = match function {
            None => ServerMessage::error(id, RemoteError::unknown_handle(handle)),
            Some(function) => match panic::catch_unwind(AssertUnwindSafe(|| function(args))) {
                Ok(()) => ServerMessage::value(id, Value::Null),
                Err(payload) => {
                    error!(handle, "exposed function panicked");
                    ServerMessage::error(id, panicked(payload.as_ref()))
                }
            },
        };
        let _ = self.outbound.send(message);
    }
}

fn panicked(payload: &(dyn Any + Send)) -> RemoteError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    RemoteError::panicked(message)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{
        TransportError,
        port,
        remote::{Remote, Returned},
    };

    struct Target {
        disposed: Arc<AtomicUsize>,
    }

    impl Exposed for Target {
        fn dispatch(
            &self,
            operation: &str,
            _args: Vec<Incoming>,
        ) -> BoxFuture<'static, Result<Reply, RemoteError>> {
            match operation {
                "explode" => panic!("sync boom"),
                "explode_later" => Box::pin(async { explode_later() }),
                _ => {
                    let disposed = Arc::clone(&self.disposed);
                    Box::pin(async move {
                        Ok(Reply::Function(Arc::new(move |_: Vec<Value>| {
                            disposed.fetch_add(1, Ordering::SeqCst);
                        })))
                    })
                }
            }
        }
    }

    fn explode_later() -> Result<Reply, RemoteError> {
        panic!("async boom")
    }

    fn connect() -> (Remote, Arc<AtomicUsize>) {
        let disposed = Arc::new(AtomicUsize::new(0));
        let (client, worker) = port::channel();
        expose(
            Arc::new(Target {
                disposed: Arc::clone(&disposed),
            }),
            worker,
        );
        (Remote::wrap(client), disposed)
    }

    #[tokio::test]
    async fn panics_become_rejections() {
        let (remote, _) = connect();

        let err = remote.invoke("explode", Vec::new()).await.unwrap_err();
        let TransportError::Remote(err) = err else {
            panic!("expected remote error");
        };
        assert!(err.is(portlink_core::error::HANDLER_PANICKED));
        assert_eq!(err.message, "sync boom");

        let err = remote.invoke("explode_later", Vec::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Remote(e) if e.message == "async boom"));

        // the connection survives
        assert!(remote.invoke("open", Vec::new()).await.is_ok());
    }

    #[tokio::test]
    async fn returned_function_is_callable() {
        let (remote, disposed) = connect();

        let Ok(Returned::Function(function)) = remote.invoke("open", Vec::new()).await else {
            panic!("expected a function");
        };
        assert!(function.apply(Vec::new()).await.is_ok());
        assert!(function.apply(Vec::new()).await.is_ok());
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }
}
