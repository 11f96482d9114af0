//! Response assembly: turns a [`HandlerReply`] into a wire envelope,
//! applying the body-typing rules.
//!
//! - a binary blob keeps `type: buffer`;
//! - a structured value is serialized to JSON (pretty-printed on a `pretty`
//!   query param, JSONP-wrapped on a `callback` query param);
//! - a plain string keeps `type: string`;
//! - file replies carry the path for the parent to stream.

use std::collections::BTreeMap;

use spawnpool_proto::{
    RequestEnvelope, ResponseBody, ResponseEnvelope, ResponseType, encode_json_body, status,
};

use crate::handler::HandlerReply;

fn has_header(headers: &BTreeMap<String, String>, name: &str) -> bool {
    headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

/// Build the wire envelope for a finished handler reply.
pub fn build_response(reply: HandlerReply, env: &RequestEnvelope) -> ResponseEnvelope {
    match reply {
        HandlerReply::Error(message) => ResponseEnvelope::internal_error(&env.id, message),

        HandlerReply::Json(value) => {
            let (body, content_type) = encode_json_body(&value, &env.query);
            let mut headers = BTreeMap::new();
            headers.insert("Content-Type".to_string(), content_type.to_string());
            ResponseEnvelope {
                id: env.id.clone(),
                status: status::OK.to_string(),
                body_type: ResponseType::String,
                headers,
                body: ResponseBody::Text(body),
                perf: None,
                log_error: None,
                delete: false,
            }
        }

        HandlerReply::Full {
            status,
            headers,
            body,
        } => {
            let body_type = match &body {
                ResponseBody::Binary(_) => ResponseType::Buffer,
                ResponseBody::Text(_) | ResponseBody::Empty => ResponseType::String,
            };
            ResponseEnvelope {
                id: env.id.clone(),
                status,
                body_type,
                headers,
                body,
                perf: None,
                log_error: None,
                delete: false,
            }
        }

        HandlerReply::File {
            path,
            mut headers,
            delete,
        } => {
            if !has_header(&headers, "Content-Type") {
                headers.insert(
                    "Content-Type".to_string(),
                    "application/octet-stream".to_string(),
                );
            }
            ResponseEnvelope {
                id: env.id.clone(),
                status: status::OK.to_string(),
                body_type: ResponseType::File,
                headers,
                body: ResponseBody::Text(path),
                perf: None,
                log_error: None,
                delete,
            }
        }
    }
}
