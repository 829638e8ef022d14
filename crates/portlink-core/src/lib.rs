//! Core abstractions for contract-based worker bridges.
//!
//! This crate provides the fundamental building blocks:
//! - `Contract`, `Call`, `Subscription` - Static operation declarations
//! - `ClientId`, `Binary` - Values that cross the channel
//! - `RemoteError` - Serializable error body for rejected calls
//! - `SubscriptionState`, `Disposer` - Subscription lifecycle
//! - `Subject`, `BehaviorSubject` - Multicast push sources

pub mod contract;
pub mod disposer;
pub mod error;
pub mod source;
pub mod state;
pub mod value;

pub use contract::{
    Call, Contract, ContractError, Operation, OperationDescriptor, OperationKind, RegisterClient,
    RegistryContract, Subscription, Wire,
};
pub use disposer::Disposer;
pub use error::RemoteError;
pub use source::{
    BehaviorSubject, Observer, Publisher, PushSource, Shared, SourceExt, SourceSubscription,
    Subject,
};
pub use state::SubscriptionState;
pub use value::{Binary, ClientId};
