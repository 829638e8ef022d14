//! Channel plumbing between clients and a shared worker.
//!
//! This crate provides:
//! - `port::channel` - Ordered in-process message port pairs
//! - `Remote` - Client endpoint with request correlation and callbacks
//! - `expose` - Worker endpoint serving an `Exposed` object
//! - `LockManager` - Named locks used for client liveness
//! - `SharedWorker` - One worker, many ports

pub mod error;
pub mod expose;
pub mod locks;
pub mod port;
pub mod protocol;
pub mod remote;
pub mod shared;

pub use error::TransportError;
pub use expose::{Exposed, Incoming, RemoteFn, Reply, expose};
pub use locks::{LockGuard, LockManager, LockRequest, LockTicket};
pub use port::{ClientPort, WorkerPort};
pub use remote::{Arg, LocalFn, PendingReply, Remote, RemoteFunction, Returned};
pub use shared::SharedWorker;

/// Boxed future returned by exposed operations.
pub type BoxFuture<T> = futures::future::BoxFuture<'static, T>;
