//! The shared worker: registry operation plus contract routes.

use std::{collections::HashMap, fmt, sync::Arc};

use futures::{FutureExt, future};
use portlink_core::{
    ClientId, OperationDescriptor, OperationKind, RemoteError,
    contract::REGISTER_CLIENT,
    value,
};
use portlink_transport::{BoxFuture, Exposed, Incoming, LockManager, Reply, SharedWorker};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    ClientRegistry, WorkerBuilder, WorkerContext, WorkerOptions,
    builder::{Handler, Request},
};

pub(crate) struct Route {
    pub(crate) contract: &'static str,
    pub(crate) kind: OperationKind,
    pub(crate) handler: Handler,
}

struct WorkerInner {
    options: WorkerOptions,
    context: WorkerContext,
    routes: HashMap<&'static str, Route>,
}

/// Contract implementation exposed to clients.
///
/// Every request carries the calling client id as its first argument.
/// Anything other than `registerClient` from an unregistered client is
/// rejected with `UNKNOWN_CLIENT` before the handler runs.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    #[must_use]
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    pub(crate) fn new(
        options: WorkerOptions,
        context: WorkerContext,
        routes: HashMap<&'static str, Route>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                options,
                context,
                routes,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    #[must_use]
    pub fn context(&self) -> &WorkerContext {
        &self.inner.context
    }

    #[must_use]
    pub fn clients(&self) -> &ClientRegistry {
        self.inner.context.clients()
    }

    #[must_use]
    pub fn locks(&self) -> &LockManager {
        self.clients().locks()
    }

    /// Every served operation, sorted by name.
    #[must_use]
    pub fn operations(&self) -> Vec<OperationDescriptor> {
        let mut operations: Vec<_> = self
            .inner
            .routes
            .iter()
            .map(|(&name, route)| OperationDescriptor {
                name,
                kind: route.kind,
            })
            .chain(std::iter::once(OperationDescriptor {
                name: REGISTER_CLIENT,
                kind: OperationKind::Mutation,
            }))
            .collect();
        operations.sort_by_key(|op| op.name);
        operations
    }

    /// Host the worker so that clients can connect to it.
    #[must_use]
    pub fn into_shared(self) -> SharedWorker {
        let name = self.name().to_string();
        let locks = self.locks().clone();
        SharedWorker::new(name, Arc::new(self), locks)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name())
            .field("operations", &self.inner.routes.len())
            .field("clients", &self.clients().len())
            .finish()
    }
}

fn reject(err: RemoteError) -> BoxFuture<Result<Reply, RemoteError>> {
    future::ready(Err(err)).boxed()
}

impl Exposed for Worker {
    fn dispatch(
        &self,
        operation: &str,
        args: Vec<Incoming>,
    ) -> BoxFuture<Result<Reply, RemoteError>> {
        let mut args = args.into_iter();
        let client_id = match args
            .next()
            .and_then(Incoming::into_value)
            .map(value::decode::<ClientId>)
        {
            Some(Ok(client_id)) => client_id,
            _ => {
                warn!(operation, "request without a client id");
                return reject(RemoteError::invalid_payload(format!(
                    "{operation} expects a client id as its first argument"
                )));
            }
        };

        if operation == REGISTER_CLIENT {
            self.clients().register(&client_id);
            return future::ready(Ok(Reply::Value(Value::Null))).boxed();
        }

        if !self.clients().contains(&client_id) {
            debug!(client_id = %client_id, operation, "request from unknown client");
            return reject(RemoteError::unknown_client(&client_id));
        }

        let Some(route) = self.inner.routes.get(operation) else {
            return reject(RemoteError::unknown_operation(operation));
        };

        (route.handler)(Request {
            context: self.inner.context.clone(),
            client_id,
            args: args.collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use portlink_core::{
        Call, Contract, Operation,
        error::{INVALID_PAYLOAD, UNKNOWN_CLIENT, UNKNOWN_OPERATION},
    };
    use serde_json::json;

    use super::*;

    struct Greeter;
    struct Greet;

    impl Contract for Greeter {
        const NAME: &'static str = "greeter";

        fn operations() -> Vec<OperationDescriptor> {
            vec![OperationDescriptor::call::<Greet>()]
        }
    }

    impl Operation for Greet {
        type Contract = Greeter;
        type Input = String;
        const NAME: &'static str = "greet";
    }

    impl Call for Greet {
        type Output = String;
    }

    fn worker() -> Worker {
        Worker::builder()
            .call::<Greet, _, _>(|_, client_id, name| async move {
                Ok(format!("{name} from {client_id}"))
            })
            .build()
            .unwrap()
    }

    fn value(v: Value) -> Incoming {
        Incoming::Value(v)
    }

    #[tokio::test]
    async fn unregistered_client_is_rejected() {
        let worker = worker();
        let err = worker
            .dispatch("greet", vec![value(json!("c1")), value(json!("Ada"))])
            .await
            .unwrap_err();
        assert!(err.is(UNKNOWN_CLIENT));
        assert_eq!(err.message, "Unknown client c1");
    }

    #[tokio::test]
    async fn registered_client_is_served() {
        let worker = worker();
        let _lease = worker.locks().acquire("c1").await;

        tokio_test::assert_ok!(worker.dispatch(REGISTER_CLIENT, vec![value(json!("c1"))]).await);
        tokio_test::assert_ok!(worker.dispatch(REGISTER_CLIENT, vec![value(json!("c1"))]).await);
        assert_eq!(worker.clients().len(), 1);

        let reply = worker
            .dispatch("greet", vec![value(json!("c1")), value(json!("Ada"))])
            .await;
        let greeting = match reply {
            Ok(Reply::Value(greeting)) => greeting,
            other => panic!("unexpected reply: {other:?}"),
        };
        assert_eq!(greeting, json!("Ada from c1"));

        let err = worker
            .dispatch("wave", vec![value(json!("c1"))])
            .await
            .unwrap_err();
        assert!(err.is(UNKNOWN_OPERATION));

        let err = worker
            .dispatch("greet", vec![value(json!("c1")), value(json!(5))])
            .await
            .unwrap_err();
        assert!(err.is(INVALID_PAYLOAD));
    }

    #[tokio::test]
    async fn missing_client_id_is_invalid() {
        let err = worker().dispatch("greet", Vec::new()).await.unwrap_err();
        assert!(err.is(INVALID_PAYLOAD));
    }

    #[test]
    fn lists_registry_operation() {
        let ops = worker().operations();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].name, "greet");
        assert_eq!(ops[1].name, REGISTER_CLIENT);
    }
}
