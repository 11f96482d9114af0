//! Server-sent-events support for in-flight requests.

use std::sync::Arc;

use spawnpool_proto::{Reply, ResponseBody, ResponseEnvelope, ResponseType, status};

use crate::{RequestSlot, SharedWriter, WorkerError};

/// Streaming handle attached to every [`crate::WorkerRequest`].
///
/// [`SseHandle::send`] emits an out-of-band `sse` frame carrying one chunk;
/// [`SseHandle::end`] finalises the request with an empty `sse`-typed
/// response. Once `send` has been called, the handler's eventual
/// [`crate::HandlerReply`] is ignored — the stream ends only through `end`
/// (or the co-enforced request deadline, which also bounds a stream whose
/// client silently disconnected).
#[derive(Clone)]
pub struct SseHandle {
    inner: Arc<SseInner>,
}

struct SseInner {
    id: String,
    writer: SharedWriter,
    slot: Arc<RequestSlot>,
}

impl SseHandle {
    pub(crate) fn new(id: String, writer: SharedWriter, slot: Arc<RequestSlot>) -> Self {
        Self {
            inner: Arc::new(SseInner { id, writer, slot }),
        }
    }

    /// `true` once [`SseHandle::send`] has been called for this request.
    pub fn started(&self) -> bool {
        self.inner.slot.sse_started()
    }

    /// Emit one event chunk.
    ///
    /// # Errors
    ///
    /// Fails if the outbound pipe to the parent is gone.
    pub async fn send(&self, chunk: impl Into<String>) -> Result<(), WorkerError> {
        self.inner.slot.mark_sse();
        let reply = Reply::Sse {
            id: self.inner.id.clone(),
            chunk: chunk.into(),
        };
        self.inner.writer.lock().await.send(&reply).await?;
        Ok(())
    }

    /// Finalise the stream. Idempotent: only the first settle of the request
    /// (end, deadline, or regular completion) takes effect.
    ///
    /// # Errors
    ///
    /// Fails if the final response frame cannot be written.
    pub async fn end(&self) -> Result<(), WorkerError> {
        if !self.inner.slot.settle() {
            return Ok(());
        }
        let envelope = ResponseEnvelope {
            id: self.inner.id.clone(),
            status: status::OK.to_string(),
            body_type: ResponseType::Sse,
            headers: Default::default(),
            body: ResponseBody::Empty,
            perf: None,
            log_error: None,
            delete: false,
        };
        let result = self
            .inner
            .writer
            .lock()
            .await
            .send(&Reply::Response(Box::new(envelope)))
            .await;
        self.inner.slot.finish_active();
        result?;
        Ok(())
    }
}
