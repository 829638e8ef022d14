//! Client side of a portlink bridge.
//!
//! This crate provides:
//! - `Client` - Registration with a shared worker and its liveness lease
//! - `DispatchProxy` - Typed forwarding of contract operations
//! - `Subscriptions`, `SharedSubscription` - Lazily shared update streams
//! - `ConnectionPool` - Explicit cache of worker endpoints

pub mod client;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod subscription;

pub use client::{Client, ClientOptions};
pub use error::{CallError, ClientError};
pub use pool::ConnectionPool;
pub use proxy::{DispatchProxy, PendingCall, PendingSubscription, RemoteDisposer};
pub use subscription::{SharedSubscription, SubscriptionStream, Subscriptions};
