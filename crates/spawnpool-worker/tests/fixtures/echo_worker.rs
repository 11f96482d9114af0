//! Echo worker fixture: a small but complete worker binary used by the
//! integration tests. It echoes requests back as JSON, with query-selected
//! modes for slow handlers, binary bodies, SSE streams, file responses, and
//! forced errors.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};

use spawnpool_worker::{
    HandlerReply, WorkerHandler, WorkerRequest, WorkerRuntime, logging,
};

struct EchoHandler;

#[async_trait]
impl WorkerHandler for EchoHandler {
    async fn request(&self, req: WorkerRequest) -> HandlerReply {
        let env = &req.envelope;
        match env.query.get("mode").map(String::as_str) {
            Some("sleep") => {
                let ms = env
                    .query
                    .get("ms")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500u64);
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                HandlerReply::Json(json!({"slept_ms": ms, "pid": std::process::id()}))
            }
            Some("binary") => HandlerReply::Full {
                status: "200 OK".to_string(),
                headers: BTreeMap::from([(
                    "Content-Type".to_string(),
                    "application/octet-stream".to_string(),
                )]),
                body: spawnpool_proto::ResponseBody::Binary(Bytes::from_static(&[
                    0xca, 0xfe, 0xba, 0xbe,
                ])),
            },
            Some("sse") => {
                for n in 0..3 {
                    if req.sse.send(format!("tick {n}")).await.is_err() {
                        break;
                    }
                }
                let _ = req.sse.end().await;
                HandlerReply::Json(Value::Null)
            }
            Some("file") => HandlerReply::File {
                path: env.query.get("path").cloned().unwrap_or_default(),
                headers: BTreeMap::new(),
                delete: env.query.get("delete").is_some(),
            },
            Some("error") => HandlerReply::Error("echo worker forced error".to_string()),
            _ => HandlerReply::Json(json!({
                "uri": env.uri,
                "method": env.method,
                "params": env.params,
                "raw_len": env.raw.as_ref().map(|b| b.len()).unwrap_or(0),
                "pid": std::process::id(),
            })),
        }
    }

    async fn custom(&self, params: Value) -> Result<Value, String> {
        if params.get("fail").is_some() {
            return Err("custom failure requested".to_string());
        }
        Ok(json!({
            "code": 0,
            "params": params,
            "pid": std::process::id(),
        }))
    }

    async fn message(&self, data: Value) {
        tracing::info!("broadcast message received: {data}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let runtime = WorkerRuntime::new(EchoHandler);
    let code = runtime.run_stdio().await?;
    std::process::exit(code);
}
