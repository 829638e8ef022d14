//! Static contract declarations.
//!
//! A contract is a set of zero-sized marker types, one per operation. Each
//! marker fixes the operation name and its input/output (or update) types;
//! client proxies and worker builders are generic over the markers, so the
//! forwarding function for every operation is resolved at compile time.
//!
//! The client view of an operation is its declared signature. The worker
//! view is the same signature with the calling `ClientId` prepended, and for
//! subscriptions the three delivery callbacks inserted before the input:
//!
//! | kind | client | worker |
//! |---|---|---|
//! | call | `(input?) -> Output` | `(client_id, input?) -> Output` |
//! | subscription | `(on_next, on_error, on_complete, input?) -> Disposer` | `(client_id, observer, input?) -> Disposer` |
//!
//! An input of `()` is omitted from the argument list rather than sent as
//! an empty value.

use std::collections::HashSet;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Operation name reserved for client registration.
pub const REGISTER_CLIENT: &str = "registerClient";

/// Values that may cross the channel.
pub trait Wire: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Wire for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// Operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Request/response that reads state.
    Query,
    /// Request/response that modifies state.
    Mutation,
    /// Continuous push stream.
    Subscription,
}

impl OperationKind {
    /// Whether this is a request/response kind.
    #[must_use]
    pub const fn is_call(self) -> bool {
        matches!(self, Self::Query | Self::Mutation)
    }
}

/// A statically declared set of operations.
pub trait Contract: Send + Sync + 'static {
    /// Contract name, used in logs and errors.
    const NAME: &'static str;

    /// Every operation in the contract.
    fn operations() -> Vec<OperationDescriptor>;
}

/// A single named operation of a contract.
pub trait Operation: Send + Sync + 'static {
    /// Contract this operation belongs to.
    type Contract: Contract;
    /// Parameter supplied by the caller; `()` for none.
    type Input: Wire;
    /// Operation name, unique within the contract.
    const NAME: &'static str;
}

/// Request/response operation.
pub trait Call: Operation {
    /// Response value.
    type Output: Wire;
    /// Query or mutation.
    const KIND: OperationKind = OperationKind::Query;
}

/// Push-subscription operation.
pub trait Subscription: Operation {
    /// Pushed value.
    type Update: Wire;
}

/// Runtime description of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationDescriptor {
    /// Operation name.
    pub name: &'static str,
    /// Operation kind.
    pub kind: OperationKind,
}

impl OperationDescriptor {
    /// Describe a call operation.
    #[must_use]
    pub const fn call<Op: Call>() -> Self {
        Self {
            name: Op::NAME,
            kind: Op::KIND,
        }
    }

    /// Describe a subscription operation.
    #[must_use]
    pub const fn subscription<Op: Subscription>() -> Self {
        Self {
            name: Op::NAME,
            kind: OperationKind::Subscription,
        }
    }
}

/// Contract declaration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("Duplicate operation {operation} in contract {contract}")]
    DuplicateOperation {
        contract: &'static str,
        operation: &'static str,
    },
    #[error("Operation name {operation} is reserved")]
    ReservedName { operation: &'static str },
    #[error("Operation name in contract {contract} is empty")]
    EmptyName { contract: &'static str },
    #[error("Operation {operation} of contract {contract} has no handler")]
    MissingHandler {
        contract: &'static str,
        operation: &'static str,
    },
    #[error("Operation {operation} is not declared by contract {contract}")]
    UndeclaredOperation {
        contract: &'static str,
        operation: &'static str,
    },
    #[error("Operation {operation} is declared as {declared:?} but handled as {handled:?}")]
    KindMismatch {
        operation: &'static str,
        declared: OperationKind,
        handled: OperationKind,
    },
}

/// Check that a user contract has unique, non-reserved operation names.
///
/// # Errors
/// Returns the first violation found.
pub fn validate_contract<C: Contract>() -> Result<Vec<OperationDescriptor>, ContractError> {
    let operations = C::operations();
    let mut seen = HashSet::with_capacity(operations.len());

    for op in &operations {
        if op.name.is_empty() {
            return Err(ContractError::EmptyName { contract: C::NAME });
        }
        if op.name == REGISTER_CLIENT {
            return Err(ContractError::ReservedName { operation: op.name });
        }
        if !seen.insert(op.name) {
            return Err(ContractError::DuplicateOperation {
                contract: C::NAME,
                operation: op.name,
            });
        }
    }

    Ok(operations)
}

/// Built-in contract every worker serves.
pub struct RegistryContract;

impl Contract for RegistryContract {
    const NAME: &'static str = "registry";

    fn operations() -> Vec<OperationDescriptor> {
        vec![OperationDescriptor::call::<RegisterClient>()]
    }
}

/// Register the calling client with the worker.
pub struct RegisterClient;

impl Operation for RegisterClient {
    type Contract = RegistryContract;
    type Input = ();
    const NAME: &'static str = REGISTER_CLIENT;
}

impl Call for RegisterClient {
    type Output = ();
    const KIND: OperationKind = OperationKind::Mutation;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    struct EchoOp;
    struct WatchOp;
    struct Clash;
    struct ClashOp;

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

    impl Contract for Clash {
        const NAME: &'static str = "clash";

        fn operations() -> Vec<OperationDescriptor> {
            vec![
                OperationDescriptor::call::<ClashOp>(),
                OperationDescriptor::call::<ClashOp>(),
            ]
        }
    }

    impl Operation for ClashOp {
        type Contract = Clash;
        type Input = ();
        const NAME: &'static str = "same";
    }

    impl Call for ClashOp {
        type Output = ();
    }

    #[test]
    fn descriptors_carry_kind() {
        let ops = tokio_test::assert_ok!(validate_contract::<Echo>());
        assert_eq!(ops[0].kind, OperationKind::Mutation);
        assert!(ops[0].kind.is_call());
        assert_eq!(ops[1].kind, OperationKind::Subscription);
        assert!(!ops[1].kind.is_call());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = tokio_test::assert_err!(validate_contract::<Clash>());
        assert_eq!(
            err,
            ContractError::DuplicateOperation {
                contract: "clash",
                operation: "same"
            }
        );
    }

    #[test]
    fn registry_name_is_reserved_for_user_contracts() {
        let err = tokio_test::assert_err!(validate_contract::<RegistryContract>());
        assert_eq!(
            err,
            ContractError::ReservedName {
                operation: REGISTER_CLIENT
            }
        );
    }
}
