//! Parent ↔ child message types.
//!
//! Every frame on the wire is one [`Command`] (parent → child) or one
//! [`Reply`] (child → parent), discriminated by its `cmd` field. User-facing
//! payloads (`params`, `maint`/`message` data) are JSON values so handler
//! code sees the same data model on both sides of the pipe; binary payloads
//! ride in dedicated [`Bytes`] fields which the codec carries natively.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP status lines used across the supervisor and worker.
pub mod status {
    pub const OK: &str = "200 OK";
    pub const TOO_MANY_REQUESTS: &str = "429 Too Many Requests";
    pub const INTERNAL_SERVER_ERROR: &str = "500 Internal Server Error";
    pub const SERVICE_UNAVAILABLE: &str = "503 Service Unavailable";
    pub const GATEWAY_TIMEOUT: &str = "504 Gateway Timeout";

    /// Numeric code of a status line, `0` if unparseable.
    pub fn code(line: &str) -> u16 {
        line.split_whitespace()
            .next()
            .and_then(|w| w.parse().ok())
            .unwrap_or(0)
    }

    /// `true` for a `2xx` status line.
    pub fn is_success(line: &str) -> bool {
        (200..300).contains(&code(line))
    }
}

/// Trimmed view of the parent host, sent with the `startup` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub hostname: String,
    pub ip: String,
    /// Whether the parent traps uncaught errors and will emergency-kill
    /// children on one.
    #[serde(default)]
    pub uncatch: bool,
}

/// Worker-side response compression settings, resolved from the pool config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Regex a response `Content-Type` must match to be compressible.
    #[serde(default = "CompressConfig::default_content_match")]
    pub content_match: String,
    /// Offer brotli ahead of gzip/deflate when the client accepts it.
    #[serde(default)]
    pub brotli: bool,
}

impl CompressConfig {
    fn default_content_match() -> String {
        "^text/|javascript|json|xml".to_string()
    }
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            content_match: Self::default_content_match(),
            brotli: false,
        }
    }
}

/// The slice of pool configuration a child needs to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerBootConfig {
    /// Path of the user script/module the worker should load, if any.
    #[serde(default)]
    pub script: Option<String>,
    /// Per-request deadline the worker co-enforces; `0` disables.
    #[serde(default)]
    pub request_timeout_sec: u64,
    #[serde(default)]
    pub compress: CompressConfig,
    /// Free-form extra configuration passed through to the handler.
    #[serde(default)]
    pub extra: Value,
}

/// Metadata of one uploaded file. The file body stays on disk; only the
/// descriptor crosses the pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub path: String,
}

/// Performance counters a worker may attach to a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Perf {
    #[serde(default)]
    pub elapsed_ms: f64,
    #[serde(default)]
    pub counters: BTreeMap<String, f64>,
}

/// A serialisable request, built by the proxy from the HTTP collaborator's
/// arguments and replayed to the child.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub http_version: String,
    /// Path portion of the request.
    #[serde(default)]
    pub uri: String,
    /// Full request URL as received.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub files: Vec<UploadedFile>,
    /// Structured request parameters.
    #[serde(default)]
    pub params: Value,
    /// Raw binary request body, carried as a native byte string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Bytes>,
}

/// Messages the parent writes to a child's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Startup {
        config: WorkerBootConfig,
        server: ServerInfo,
    },
    Request(Box<RequestEnvelope>),
    Custom {
        id: String,
        params: Value,
    },
    Maint {
        #[serde(default)]
        data: Value,
    },
    Message {
        #[serde(default)]
        data: Value,
    },
    Internal {
        #[serde(default)]
        data: Value,
    },
    Shutdown,
}

/// Body type discriminator of a [`ResponseEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Text body, subject to worker-side compression.
    String,
    /// Binary body.
    Buffer,
    /// The body is a filesystem path; the parent streams the file.
    File,
    /// Uninterpreted body (custom requests).
    Passthrough,
    /// Server-sent-events terminator.
    Sse,
}

/// Response payload. Untagged: CBOR text decodes as [`ResponseBody::Text`],
/// a byte string as [`ResponseBody::Binary`], null as [`ResponseBody::Empty`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Text(String),
    Binary(Bytes),
    Empty,
}

impl Default for ResponseBody {
    fn default() -> Self {
        Self::Empty
    }
}

impl ResponseBody {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Binary(b) => b.is_empty(),
            Self::Empty => true,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
            Self::Empty => 0,
        }
    }
}

/// A completed response, written by the child and correlated by the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    /// Full status line, e.g. `"200 OK"`.
    pub status: String,
    #[serde(rename = "type")]
    pub body_type: ResponseType,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: ResponseBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf: Option<Perf>,
    /// A handler error worth logging on the parent side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_error: Option<String>,
    /// For `file` responses: unlink the file after it has been handed off.
    #[serde(default)]
    pub delete: bool,
}

impl ResponseEnvelope {
    /// A `500 Internal Server Error` response for the given request id.
    pub fn internal_error(id: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            id: id.into(),
            status: status::INTERNAL_SERVER_ERROR.to_string(),
            body_type: ResponseType::String,
            headers: BTreeMap::new(),
            body: ResponseBody::Text(message.clone()),
            perf: None,
            log_error: Some(message),
            delete: false,
        }
    }
}

/// Messages a child writes to its stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Reply {
    StartupComplete,
    Response(Box<ResponseEnvelope>),
    /// Out-of-band server-sent-event chunk for an in-flight request.
    Sse { id: String, chunk: String },
    MaintComplete,
    Message {
        #[serde(default)]
        data: Value,
    },
    Internal {
        #[serde(default)]
        data: Value,
    },
}
