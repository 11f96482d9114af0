//! Multi-process worker pool supervisor.
//!
//! A [`PoolManager`] owns named [`WorkerPool`]s; each pool spawns child
//! worker processes (binaries built on `spawnpool-worker`) and dispatches
//! requests to the least-loaded child over a length-prefixed binary channel
//! on the child's stdio. A 1 Hz tick drives pool health: auto-scaling,
//! rolling maintenance, rolling restart, and per-child request-budget
//! recycling.
//!
//! The HTTP server producing requests is an external collaborator; it hands
//! [`RequestArgs`] to [`WorkerPool::dispatch`] (directly or through a
//! [`router::RouteRegistrar`] binding) and receives `(status, headers,
//! body)` back as [`ResponseParts`].

pub mod config;
pub mod error;
pub mod events;
pub mod id;
pub mod logging;
pub mod manager;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod router;
pub mod transport;

pub use config::{ChildRequestBudget, MaintMethod, ManagerConfig, PoolConfig};
pub use error::{CustomError, DispatchError, PoolError};
pub use events::{PoolEvent, ScaleAction};
pub use manager::PoolManager;
pub use pool::WorkerPool;
pub use proxy::{ProxyState, WorkerProxy};
pub use request::{DispatchBody, RequestArgs, ResponseParts};
pub use transport::{ChildTransport, MockChildIo, MockTransport, ProcessTransport};
