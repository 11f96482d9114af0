//! Pool event stream.
//!
//! Each pool broadcasts control-loop decisions and child-originated
//! messages. Subscribers that fall behind lose the oldest events (standard
//! `tokio::sync::broadcast` lag semantics); events are advisory, never
//! load-bearing for correctness.

use serde_json::Value;

/// Direction of an auto-scale action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    Add,
    Remove,
}

/// One pool event.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// The auto-scaler added or removed a worker.
    Autoscale { action: ScaleAction, pid: u32 },
    /// A worker was sent into maintenance.
    Maint { pid: u32 },
    /// A worker was shut down for recycle or rolling restart; the
    /// auto-scaler replaces it on a following tick.
    Restart { pid: u32 },
    /// A child sent a `message` frame up to the parent.
    Message { pid: u32, data: Value },
    /// A child sent an `internal` (debug-channel) frame.
    Internal { pid: u32, data: Value },
}
