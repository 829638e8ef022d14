//! Worker side of a portlink bridge.
//!
//! This crate provides:
//! - `ClientRegistry` - Registered clients and their live subscriptions
//! - `WorkerContext` - `subscribe` / `notify` for subscription handlers
//! - `WorkerBuilder` - Typed handler registration with contract checks
//! - `Worker` - The exposed object shared by every client

pub mod builder;
pub mod context;
pub mod error;
pub mod observer;
pub mod registry;
pub mod worker;

pub use builder::{WorkerBuilder, WorkerOptions};
pub use context::WorkerContext;
pub use error::{HandlerError, HandlerResult};
pub use observer::RemoteObserver;
pub use registry::{ClientRecord, ClientRegistry, SubscriptionSet};
pub use worker::Worker;
