//! JSON body encoding shared by the worker and the proxy.
//!
//! A structured handler reply becomes a JSON text body. Two query parameters
//! steer the encoding: `pretty` pretty-prints, and `callback` wraps the JSON
//! as a padded script (`callback(json);`) served as `text/javascript`.

use std::collections::BTreeMap;

use serde_json::Value;

/// Content type of a plain JSON body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type of a JSONP (padded) body.
pub const CONTENT_TYPE_JS: &str = "text/javascript";

/// Encode `value` per the request's query parameters.
///
/// Returns the body text and the `Content-Type` to serve it with.
pub fn encode_json_body(value: &Value, query: &BTreeMap<String, String>) -> (String, &'static str) {
    let json = if query.contains_key("pretty") {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
    } else {
        serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
    };

    match query.get("callback") {
        Some(callback) if !callback.is_empty() => {
            (format!("{callback}({json});"), CONTENT_TYPE_JS)
        }
        _ => (json, CONTENT_TYPE_JSON),
    }
}
