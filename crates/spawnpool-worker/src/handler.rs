//! The handler contract a worker binary implements.
//!
//! [`WorkerHandler`] is the seam between the runtime's protocol loop and user
//! code. Only [`WorkerHandler::request`] is mandatory; every lifecycle hook
//! has a reasonable default. Handler results are explicit tagged variants —
//! there is no positional-callback overloading at this boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use spawnpool_proto::{RequestEnvelope, ResponseBody, ServerInfo, WorkerBootConfig};

use crate::sse::SseHandle;

/// One incoming request as seen by a handler: the decoded envelope plus a
/// handle for streaming server-sent events back out-of-band.
pub struct WorkerRequest {
    pub envelope: RequestEnvelope,
    pub sse: SseHandle,
}

impl WorkerRequest {
    /// Case-insensitive request-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.envelope
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A completed handler result.
#[derive(Debug)]
pub enum HandlerReply {
    /// Handler failure: becomes a `500 Internal Server Error` with the
    /// message as body, and is logged on the parent side.
    Error(String),
    /// Fully specified response parts.
    Full {
        status: String,
        headers: BTreeMap<String, String>,
        body: ResponseBody,
    },
    /// Structured value: serialized as JSON, honouring the request's
    /// `pretty` and `callback` query parameters.
    Json(Value),
    /// Serve a file from disk. The parent stats and streams the path;
    /// `delete` unlinks it once the stream has been handed off.
    File {
        path: String,
        headers: BTreeMap<String, String>,
        delete: bool,
    },
}

/// Lifecycle and request hooks of a worker.
///
/// Hooks run on the worker's tokio runtime; request hooks run concurrently,
/// one task per in-flight request.
#[async_trait]
pub trait WorkerHandler: Send + Sync + 'static {
    /// Called once after the `startup` command, before the worker reports
    /// ready. An error here aborts the worker (exit code 1), which the
    /// parent surfaces as a startup failure.
    async fn startup(&self, config: &WorkerBootConfig, server: &ServerInfo) -> anyhow::Result<()> {
        let _ = (config, server);
        Ok(())
    }

    /// Handle one request that matched no registered URI handler.
    async fn request(&self, req: WorkerRequest) -> HandlerReply;

    /// Handle a custom (non-HTTP) request. `Err` becomes a non-200 response
    /// whose status carries the message.
    async fn custom(&self, params: Value) -> Result<Value, String> {
        let _ = params;
        Err("custom requests not supported".to_string())
    }

    /// Housekeeping hook, invoked once the worker has drained to idle. The
    /// default is a no-op (the runtime has no collectable heap to speak of).
    async fn maint(&self, data: Value) -> anyhow::Result<()> {
        let _ = data;
        Ok(())
    }

    /// A broadcast message from the parent.
    async fn message(&self, data: Value) {
        let _ = data;
    }

    /// Debug-channel command. The default answers `start_debug` with a
    /// `debug_started` handshake carrying this process id.
    async fn internal(&self, data: Value) -> Option<Value> {
        match data.get("action").and_then(Value::as_str) {
            Some("start_debug") => Some(serde_json::json!({
                "action": "debug_started",
                "pid": std::process::id(),
            })),
            _ => None,
        }
    }

    /// Called after the worker has drained, just before a clean exit.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on emergency shutdown (parent death or fatal signal).
    /// Best-effort; the default delegates to [`WorkerHandler::shutdown`].
    async fn emergency_shutdown(&self) {
        if let Err(e) = self.shutdown().await {
            tracing::warn!("shutdown hook failed during emergency shutdown: {e}");
        }
    }
}
