//! Typed handler registration.

use std::{collections::HashMap, future::Future, sync::Arc};

use futures::FutureExt;
use portlink_core::{
    Call, ClientId, Contract, ContractError, Disposer, OperationDescriptor, RemoteError,
    Subscription, contract::validate_contract, value,
};
use portlink_transport::{BoxFuture, Incoming, LockManager, RemoteFn, Reply};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    ClientRegistry, HandlerError, RemoteObserver, WorkerContext,
    worker::{Route, Worker},
};

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Name used in logs and as the shared worker name.
    pub name: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: "portlink-worker".to_string(),
        }
    }
}

/// Arguments after the client id.
pub(crate) struct Request {
    pub(crate) context: WorkerContext,
    pub(crate) client_id: ClientId,
    pub(crate) args: Vec<Incoming>,
}

pub(crate) type Handler =
    Arc<dyn Fn(Request) -> BoxFuture<Result<Reply, RemoteError>> + Send + Sync>;

type Validator = fn() -> Result<Vec<OperationDescriptor>, ContractError>;

/// Builder for a [`Worker`].
///
/// Every operation of every contract a handler belongs to must be handled
/// exactly once; `build` reports the first violation.
#[derive(Default)]
pub struct WorkerBuilder {
    options: WorkerOptions,
    locks: LockManager,
    routes: HashMap<&'static str, Route>,
    contracts: Vec<(&'static str, Validator)>,
    errors: Vec<ContractError>,
}

impl WorkerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing lock manager for client leases.
    #[must_use]
    pub fn with_locks(mut self, locks: LockManager) -> Self {
        self.locks = locks;
        self
    }

    #[must_use]
    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Require every operation of `C` to be handled.
    #[must_use]
    pub fn mount<C: Contract>(mut self) -> Self {
        self.require_contract::<C>();
        self
    }

    fn require_contract<C: Contract>(&mut self) {
        if !self.contracts.iter().any(|(name, _)| *name == C::NAME) {
            self.contracts.push((C::NAME, validate_contract::<C>));
        }
    }

    fn route(&mut self, contract: &'static str, descriptor: OperationDescriptor, handler: Handler) {
        if self.routes.contains_key(descriptor.name) {
            self.errors.push(ContractError::DuplicateOperation {
                contract,
                operation: descriptor.name,
            });
            return;
        }
        self.routes.insert(
            descriptor.name,
            Route {
                contract,
                kind: descriptor.kind,
                handler,
            },
        );
    }

    /// Handle a call operation.
    ///
    /// The handler is invoked as soon as the request is read; only the
    /// returned future runs concurrently with later requests.
    #[must_use]
    pub fn call<Op, F, Fut>(mut self, handler: F) -> Self
    where
        Op: Call,
        F: Fn(WorkerContext, ClientId, Op::Input) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Op::Output, HandlerError>> + Send + 'static,
    {
        self.require_contract::<Op::Contract>();

        let handler: Handler = Arc::new(move |request: Request| {
            let Request {
                context,
                client_id,
                args,
            } = request;

            let input = match take_input::<Op::Input>(Op::NAME, args.into_iter().next()) {
                Ok(input) => input,
                Err(err) => return reject(err),
            };

            handler(context, client_id, input)
                .map(|output| -> Result<Reply, RemoteError> {
                    let output = output.map_err(RemoteError::from)?;
                    let encoded = value::encode(&output).map_err(|err| {
                        RemoteError::from(HandlerError::invalid_payload(Op::NAME, err))
                    })?;
                    Ok(Reply::Value(encoded))
                })
                .boxed()
        });

        self.route(
            <Op::Contract as Contract>::NAME,
            OperationDescriptor::call::<Op>(),
            handler,
        );
        self
    }

    /// Handle a subscription operation.
    ///
    /// The handler receives the client's callbacks and resolves to the
    /// disposer that ends the subscription.
    #[must_use]
    pub fn subscription<Op, F, Fut>(mut self, handler: F) -> Self
    where
        Op: Subscription,
        F: Fn(WorkerContext, ClientId, RemoteObserver<Op::Update>, Op::Input) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<Disposer, HandlerError>> + Send + 'static,
    {
        self.require_contract::<Op::Contract>();

        let handler: Handler = Arc::new(move |request: Request| {
            let Request {
                context,
                client_id,
                args,
            } = request;
            let mut args = args.into_iter();

            let Some([on_next, on_error, on_complete]) = take_callbacks(&mut args) else {
                return reject(RemoteError::invalid_payload(format!(
                    "{} expects next, error and complete callbacks",
                    Op::NAME
                )));
            };
            let input = match take_input::<Op::Input>(Op::NAME, args.next()) {
                Ok(input) => input,
                Err(err) => return reject(err),
            };

            let observer = RemoteObserver::new(on_next, on_error, on_complete);
            handler(context, client_id, observer, input)
                .map(|disposer| -> Result<Reply, RemoteError> {
                    let disposer = disposer.map_err(RemoteError::from)?;
                    Ok(Reply::Function(Arc::new(move |_: Vec<serde_json::Value>| {
                        disposer.dispose();
                    })))
                })
                .boxed()
        });

        self.route(
            <Op::Contract as Contract>::NAME,
            OperationDescriptor::subscription::<Op>(),
            handler,
        );
        self
    }

    /// Validate the handler set and build the worker.
    ///
    /// # Errors
    /// Returns a `ContractError` for a duplicate, missing, undeclared or
    /// mis-kinded handler, or an invalid contract.
    pub fn build(self) -> Result<Worker, ContractError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }

        let mut declared = HashMap::new();
        for &(contract, validate) in &self.contracts {
            for descriptor in validate()? {
                let Some(route) = self.routes.get(descriptor.name) else {
                    return Err(ContractError::MissingHandler {
                        contract,
                        operation: descriptor.name,
                    });
                };
                if route.kind != descriptor.kind {
                    return Err(ContractError::KindMismatch {
                        operation: descriptor.name,
                        declared: descriptor.kind,
                        handled: route.kind,
                    });
                }
                declared.insert(descriptor.name, contract);
            }
        }

        for (name, route) in &self.routes {
            if declared.get(name) != Some(&route.contract) {
                return Err(ContractError::UndeclaredOperation {
                    contract: route.contract,
                    operation: *name,
                });
            }
        }

        let context = WorkerContext::new(ClientRegistry::new(self.locks));
        Ok(Worker::new(self.options, context, self.routes))
    }
}

fn reject(err: impl Into<RemoteError>) -> BoxFuture<Result<Reply, RemoteError>> {
    futures::future::ready(Err(err.into())).boxed()
}

fn take_input<I: DeserializeOwned>(
    operation: &str,
    arg: Option<Incoming>,
) -> Result<I, RemoteError> {
    let value = match arg {
        None => None,
        Some(Incoming::Value(value)) => Some(value),
        Some(Incoming::Callback(_)) => {
            return Err(RemoteError::invalid_payload(format!(
                "{operation} expects a value input, got a callback"
            )));
        }
    };
    value::decode_input(value).map_err(|err| HandlerError::invalid_payload(operation, err).into())
}

fn take_callbacks(args: &mut impl Iterator<Item = Incoming>) -> Option<[RemoteFn; 3]> {
    let mut next = || args.next().and_then(Incoming::into_callback);
    Some([next()?, next()?, next()?])
}

#[cfg(test)]
mod tests {
    use portlink_core::{Operation, OperationKind, RegisterClient};

    use super::*;

    struct Echo;
    struct EchoOp;
    struct WatchOp;

    impl Contract for Echo {
        const NAME: &'static str = "echo";

        fn operations() -> Vec<OperationDescriptor> {
            vec![
                OperationDescriptor::call::<EchoOp>(),
                OperationDescriptor::subscription::<WatchOp>(),
            ]
        }
    }

    impl Operation for EchoOp {
        type Contract = Echo;
        type Input = String;
        const NAME: &'static str = "echo";
    }

    impl Call for EchoOp {
        type Output = String;
        const KIND: OperationKind = OperationKind::Mutation;
    }

    impl Operation for WatchOp {
        type Contract = Echo;
        type Input = ();
        const NAME: &'static str = "subscribeEcho";
    }

    impl Subscription for WatchOp {
        type Update = String;
    }

    fn echo(builder: WorkerBuilder) -> WorkerBuilder {
        builder.call::<EchoOp, _, _>(|_, client_id, msg| async move {
            Ok(format!("[{client_id}] {msg}"))
        })
    }

    fn watch(builder: WorkerBuilder) -> WorkerBuilder {
        builder.subscription::<WatchOp, _, _>(|_, _, _, ()| async { Ok(Disposer::noop()) })
    }

    #[test]
    fn complete_handler_set_builds() {
        let worker = tokio_test::assert_ok!(watch(echo(WorkerBuilder::new())).build());
        let names: Vec<_> = worker.operations().iter().map(|op| op.name).collect();
        assert_eq!(names, vec!["echo", "registerClient", "subscribeEcho"]);
    }

    #[test]
    fn missing_handler_is_reported() {
        let err = tokio_test::assert_err!(echo(WorkerBuilder::new()).build());
        assert_eq!(
            err,
            ContractError::MissingHandler {
                contract: "echo",
                operation: "subscribeEcho"
            }
        );
    }

    #[test]
    fn mounted_contract_without_handlers_is_reported() {
        let err = tokio_test::assert_err!(WorkerBuilder::new().mount::<Echo>().build());
        assert!(matches!(err, ContractError::MissingHandler { .. }));
    }

    #[test]
    fn duplicate_handler_is_reported() {
        let err = tokio_test::assert_err!(watch(echo(echo(WorkerBuilder::new()))).build());
        assert_eq!(
            err,
            ContractError::DuplicateOperation {
                contract: "echo",
                operation: "echo"
            }
        );
    }

    #[test]
    fn registry_operation_cannot_be_overridden() {
        let builder =
            WorkerBuilder::new().call::<RegisterClient, _, _>(|_, _, ()| async { Ok(()) });
        let err = tokio_test::assert_err!(builder.build());
        assert_eq!(
            err,
            ContractError::ReservedName {
                operation: <RegisterClient as Operation>::NAME
            }
        );
    }

    #[test]
    fn options_load_from_json() {
        let options: WorkerOptions = serde_json::from_str(r#"{ "name": "profile" }"#).unwrap();
        assert_eq!(options.name, "profile");

        let options: WorkerOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, WorkerOptions::default());
    }
}
