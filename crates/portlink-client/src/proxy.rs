//! Client-side dispatch proxy.
//!
//! The proxy is the client's view of a contract: every typed call is
//! forwarded to the worker with the client id prepended, and subscription
//! callbacks are handed over as remotely callable functions.

use std::{
    fmt,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use portlink_core::{
    Call, ClientId, Contract, Operation, RemoteError, Subscription,
    value::{self, encode_input},
};
use portlink_transport::{Arg, PendingReply, Remote, RemoteFunction, Returned};
use serde_json::Value;
use tracing::{trace, warn};

use crate::{CallError, client::Lease};

/// Response that has not arrived yet.
///
/// The request was already sent when this was created.
#[must_use = "the response is delivered through this future"]
pub struct PendingCall<T> {
    inner: BoxFuture<'static, Result<T, CallError>>,
}

impl<T: Send + 'static> PendingCall<T> {
    fn new(inner: impl Future<Output = Result<T, CallError>> + Send + 'static) -> Self {
        Self {
            inner: inner.boxed(),
        }
    }

    pub(crate) fn failed(err: CallError) -> Self {
        Self::new(futures::future::ready(Err(err)))
    }
}

impl<T> Future for PendingCall<T> {
    type Output = Result<T, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for PendingCall<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall").finish_non_exhaustive()
    }
}

/// Subscription request awaiting its disposer.
pub type PendingSubscription = PendingCall<RemoteDisposer>;

/// Disposer of a worker subscription.
///
/// Idempotent; clones share the same handle. Dropping every clone without
/// disposing leaves the subscription running until the client goes away.
#[derive(Clone)]
pub struct RemoteDisposer {
    function: Arc<Mutex<Option<RemoteFunction>>>,
}

impl RemoteDisposer {
    fn new(function: RemoteFunction) -> Self {
        Self {
            function: Arc::new(Mutex::new(Some(function))),
        }
    }

    /// End the subscription.
    ///
    /// The request is sent before this returns. Later calls resolve
    /// immediately.
    pub fn dispose(&self) -> PendingCall<()> {
        let Some(function) = self.function.lock().take() else {
            return PendingCall::new(futures::future::ready(Ok(())));
        };
        let reply = function.apply(Vec::new());
        PendingCall::new(async move {
            reply.await?;
            drop(function);
            Ok(())
        })
    }

    /// Whether `dispose` was called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.function.lock().is_none()
    }
}

impl fmt::Debug for RemoteDisposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDisposer")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Typed view of contract `C` bound to one client id.
pub struct DispatchProxy<C> {
    remote: Remote,
    client_id: ClientId,
    lease: Option<Arc<Lease>>,
    _contract: PhantomData<fn() -> C>,
}

impl<C> Clone for DispatchProxy<C> {
    fn clone(&self) -> Self {
        Self {
            remote: self.remote.clone(),
            client_id: self.client_id.clone(),
            lease: self.lease.clone(),
            _contract: PhantomData,
        }
    }
}

impl<C> fmt::Debug for DispatchProxy<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchProxy")
            .field("client_id", &self.client_id)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl<C> DispatchProxy<C> {
    /// Bind `remote` to `client_id`.
    ///
    /// The caller is responsible for registering the client.
    #[must_use]
    pub const fn new(remote: Remote, client_id: ClientId) -> Self {
        Self {
            remote,
            client_id,
            lease: None,
            _contract: PhantomData,
        }
    }

    pub(crate) const fn with_lease(remote: Remote, client_id: ClientId, lease: Arc<Lease>) -> Self {
        Self {
            remote,
            client_id,
            lease: Some(lease),
            _contract: PhantomData,
        }
    }

    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Whether the owning client still holds its lease.
    ///
    /// Always `true` for a proxy built with `new`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lease.as_ref().is_none_or(|lease| lease.is_held())
    }

    #[must_use]
    pub const fn remote(&self) -> &Remote {
        &self.remote
    }

    /// Same client and channel, viewed through another contract.
    #[must_use]
    pub fn cast<D: Contract>(&self) -> DispatchProxy<D> {
        DispatchProxy {
            remote: self.remote.clone(),
            client_id: self.client_id.clone(),
            lease: self.lease.clone(),
            _contract: PhantomData,
        }
    }

    /// Forward an untyped request with the client id prepended.
    pub fn invoke(&self, operation: &str, args: Vec<Arg>) -> PendingReply {
        let mut forwarded = Vec::with_capacity(args.len() + 1);
        forwarded.push(Arg::Value(Value::String(self.client_id.to_string())));
        forwarded.extend(args);
        trace!(client_id = %self.client_id, operation, "forward");
        self.remote.invoke(operation, forwarded)
    }
}

impl<C: Contract> DispatchProxy<C> {
    /// Call a request/response operation.
    pub fn call<Op>(&self, input: Op::Input) -> PendingCall<Op::Output>
    where
        Op: Call<Contract = C>,
    {
        let args = match encode_input(&input) {
            Ok(input) => input.map(Arg::Value).into_iter().collect(),
            Err(err) => {
                return PendingCall::failed(CallError::Encode {
                    operation: Op::NAME,
                    message: err.to_string(),
                });
            }
        };

        let reply = self.invoke(Op::NAME, args);
        PendingCall::new(async move {
            match reply.await? {
                Returned::Value(output) => value::decode(output).map_err(|err| CallError::Decode {
                    operation: Op::NAME,
                    message: err.to_string(),
                }),
                Returned::Function(_) => Err(CallError::UnexpectedHandle {
                    operation: Op::NAME,
                }),
            }
        })
    }

    /// Open a subscription with explicit callbacks.
    ///
    /// Resolves to the disposer once the worker has attached. Callbacks
    /// never run before that reply has been delivered.
    pub fn subscribe_with<Op>(
        &self,
        on_next: impl Fn(Op::Update) + Send + Sync + 'static,
        on_error: impl Fn(RemoteError) + Send + Sync + 'static,
        on_complete: impl Fn() + Send + Sync + 'static,
        input: Op::Input,
    ) -> PendingSubscription
    where
        Op: Subscription<Contract = C>,
    {
        match encode_input(&input) {
            Ok(input) => self.subscribe_encoded::<Op>(on_next, on_error, on_complete, input),
            Err(err) => PendingCall::failed(CallError::Encode {
                operation: Op::NAME,
                message: err.to_string(),
            }),
        }
    }

    pub(crate) fn subscribe_encoded<Op>(
        &self,
        on_next: impl Fn(Op::Update) + Send + Sync + 'static,
        on_error: impl Fn(RemoteError) + Send + Sync + 'static,
        on_complete: impl Fn() + Send + Sync + 'static,
        input: Option<Value>,
    ) -> PendingSubscription
    where
        Op: Subscription<Contract = C>,
    {
        let on_error = Arc::new(on_error);
        let next = {
            let on_error = Arc::clone(&on_error);
            move |args: Vec<Value>| {
                let update = args.into_iter().next().unwrap_or(Value::Null);
                match value::decode::<Op::Update>(update) {
                    Ok(update) => on_next(update),
                    Err(err) => {
                        warn!(operation = Op::NAME, %err, "update failed to decode");
                        on_error(RemoteError::invalid_payload(err.to_string()));
                    }
                }
            }
        };
        let error = move |args: Vec<Value>| {
            let body = args.into_iter().next().unwrap_or(Value::Null);
            let err = value::decode::<RemoteError>(body)
                .unwrap_or_else(|err| RemoteError::invalid_payload(err.to_string()));
            on_error(err);
        };
        let complete = move |_: Vec<Value>| on_complete();

        let mut args = vec![Arg::function(next), Arg::function(error), Arg::function(complete)];
        args.extend(input.map(Arg::Value));

        let reply = self.invoke(<Op as Operation>::NAME, args);
        PendingCall::new(async move {
            match reply.await? {
                Returned::Function(function) => Ok(RemoteDisposer::new(function)),
                Returned::Value(_) => Err(CallError::ExpectedHandle {
                    operation: Op::NAME,
                }),
            }
        })
    }
}
