//! The dispatch surface: what the HTTP collaborator hands a pool, and what
//! it gets back.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::Value;
use spawnpool_proto::{Perf, RequestEnvelope, UploadedFile, status};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::error::DispatchError;

/// An incoming work unit, as supplied by the HTTP collaborator (or built
/// directly for programmatic submissions).
#[derive(Debug, Default)]
pub struct RequestArgs {
    pub method: String,
    /// Path portion of the request.
    pub uri: String,
    /// Full URL as received.
    pub url: String,
    pub http_version: String,
    pub ip: String,
    pub ips: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    /// Upload descriptors; file contents never cross the pipe.
    pub files: Vec<UploadedFile>,
    /// Structured parameters.
    pub params: Value,
    /// Raw binary body; the frame codec carries it natively.
    pub raw: Option<Bytes>,
    /// Where server-sent-event chunks are delivered while the request is in
    /// flight. `None` discards any chunks the worker emits.
    pub sse_sink: Option<mpsc::UnboundedSender<String>>,
}

impl RequestArgs {
    /// Minimal constructor for programmatic submissions.
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            method: method.into(),
            url: uri.clone(),
            uri,
            http_version: "1.1".to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn into_wire(
        self,
        id: String,
    ) -> (RequestEnvelope, RequestOrigin, Option<mpsc::UnboundedSender<String>>) {
        let origin = RequestOrigin {
            method: self.method.clone(),
            uri: self.uri.clone(),
            query: self.query.clone(),
        };
        let envelope = RequestEnvelope {
            id,
            ip: self.ip,
            ips: self.ips,
            method: self.method,
            headers: self.headers,
            http_version: self.http_version,
            uri: self.uri,
            url: self.url,
            query: self.query,
            cookies: self.cookies,
            files: self.files,
            params: self.params,
            raw: self.raw,
        };
        (envelope, origin, self.sse_sink)
    }
}

/// Request facts the proxy keeps for logging and response post-processing
/// after the args have been serialised away.
#[derive(Debug, Clone)]
pub(crate) struct RequestOrigin {
    pub method: String,
    pub uri: String,
    pub query: BTreeMap<String, String>,
}

/// A response body as delivered to the caller.
pub enum DispatchBody {
    Text(String),
    Binary(Bytes),
    /// Streaming body (file responses). `Content-Length` is set in the
    /// accompanying headers.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    Empty,
}

impl std::fmt::Debug for DispatchBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(s) => f.debug_tuple("Text").field(&s.len()).finish(),
            Self::Binary(b) => f.debug_tuple("Binary").field(&b.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Empty => f.write_str("Empty"),
        }
    }
}

impl DispatchBody {
    /// Text view of the body, when it has one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// The caller-facing resolution of one dispatched request. Every dispatch
/// resolves exactly once with one of these — a worker response, a `429`/`503`
/// rejection, a `504` timeout, or a `500` for a crashed child.
#[derive(Debug)]
pub struct ResponseParts {
    /// Full status line, e.g. `"200 OK"`.
    pub status: String,
    pub headers: BTreeMap<String, String>,
    pub body: DispatchBody,
    /// Worker-side performance metrics, when the response carried them.
    pub perf: Option<Perf>,
}

impl ResponseParts {
    /// Numeric status code.
    pub fn code(&self) -> u16 {
        status::code(&self.status)
    }

    /// Resolve a request-scoped failure: the error's status line plus its
    /// message as a plain-text body.
    pub(crate) fn failure(error: DispatchError) -> Self {
        Self {
            status: error.status_line().to_string(),
            headers: BTreeMap::from([(
                "Content-Type".to_string(),
                "text/plain".to_string(),
            )]),
            body: DispatchBody::Text(error.to_string()),
            perf: None,
        }
    }
}
