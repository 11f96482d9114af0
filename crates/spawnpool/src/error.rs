//! Supervisor error types.
//!
//! Two scopes, two enums. [`PoolError`] covers pool- and proxy-scoped
//! failures that surface through `Result`s (spawn, startup, registry,
//! config). [`DispatchError`] covers request-scoped failures: these never
//! terminate the pool — each one resolves the caller's dispatch as an
//! HTTP-style response whose status line is [`DispatchError::status_line`]
//! and whose body is the error's message.

use thiserror::Error;

use spawnpool_proto::status;

/// Pool- and proxy-level errors.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Configuration rejected by validation.
    #[error("invalid pool config: {0}")]
    InvalidConfig(String),

    /// The child process (or mock) could not be started.
    #[error("failed to spawn child process: {0}")]
    SpawnFailed(String),

    /// The child did not report `startup_complete` in time and was killed.
    #[error("worker startup timed out after {0}s")]
    StartupTimeout(u64),

    /// The child exited or its stream broke before `startup_complete`.
    #[error("worker failed during startup: {0}")]
    StartupFailed(String),

    /// `create_pool` with an id that is already registered.
    #[error("pool {0:?} already exists")]
    PoolExists(String),

    /// Lookup or `remove_pool` with an unknown id.
    #[error("pool {0:?} not found")]
    PoolNotFound(String),
}

/// Why one dispatched request was resolved without a worker response.
///
/// Worker-side handler failures are not represented here: they come back as
/// a regular response envelope (status 500, `log_error` set) and pass
/// through dispatch untouched.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The pool-wide in-flight cap was already reached. `429`.
    #[error("pool {pool} is at its concurrency limit ({limit})")]
    CapExceeded { pool: String, limit: usize },

    /// No proxy in `active` state could take the request. `503`.
    #[error("no worker available: {0}")]
    NoWorkerAvailable(String),

    /// The request outlived `request_timeout_sec`. `504`.
    #[error("request timed out after {0}s")]
    RequestTimeout(u64),

    /// The child exited or became unreachable with the request pending. `500`.
    #[error("worker lost with request in flight: {0}")]
    ChildCrashed(String),

    /// A `file`-typed response could not be stat'ed or opened. `500`.
    #[error("file response failed: {0}")]
    FileResponse(String),
}

impl DispatchError {
    /// The HTTP status line this failure resolves the caller with.
    pub fn status_line(&self) -> &'static str {
        match self {
            Self::CapExceeded { .. } => status::TOO_MANY_REQUESTS,
            Self::NoWorkerAvailable(_) => status::SERVICE_UNAVAILABLE,
            Self::RequestTimeout(_) => status::GATEWAY_TIMEOUT,
            Self::ChildCrashed(_) | Self::FileResponse(_) => status::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failure of a custom (non-HTTP) dispatch. The `code` carries the status
/// line verbatim, e.g. `"500 Internal Server Error"`.
#[derive(Error, Debug)]
#[error("custom request failed ({code}): {message}")]
pub struct CustomError {
    pub code: String,
    pub message: String,
}

impl From<DispatchError> for CustomError {
    fn from(error: DispatchError) -> Self {
        Self {
            code: error.status_line().to_string(),
            message: error.to_string(),
        }
    }
}
