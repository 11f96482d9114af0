//! Child-side worker runtime.
//!
//! A worker binary embeds [`WorkerRuntime`]: it implements [`WorkerHandler`],
//! optionally registers URI-matched handlers, and calls
//! [`WorkerRuntime::run_stdio`]. The runtime then owns the child side of the
//! spawnpool protocol — it reads `cmd` frames from stdin, runs handler hooks,
//! and writes replies to stdout. Stderr stays a plain text channel for logs.
//!
//! Signal policy: SIGINT is ignored (the parent owns interactive interrupts);
//! SIGTERM means the parent is gone and triggers emergency shutdown.
//!
//! The run loop is generic over its reader/writer so tests can wire duplex
//! pipes instead of real stdio.

pub mod compress;
pub mod handler;
pub mod logging;
pub mod response;
pub mod sse;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use spawnpool_proto::{
    Command, FrameReader, FrameWriter, Perf, ProtoError, Reply, RequestEnvelope, ResponseBody,
    ResponseEnvelope, ResponseType, status,
};

pub use compress::Compressor;
pub use handler::{HandlerReply, WorkerHandler, WorkerRequest};
pub use sse::SseHandle;

/// Errors surfaced by the worker runtime.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("invalid URI handler pattern {pattern:?}: {message}")]
    Pattern { pattern: String, message: String },
}

/// Poll interval while waiting for in-flight requests to drain.
const DRAIN_POLL: Duration = Duration::from_millis(25);

pub(crate) type SharedWriter =
    Arc<Mutex<FrameWriter<Box<dyn AsyncWrite + Send + Unpin + 'static>>>>;

/// Per-request completion bookkeeping shared between the handler task, the
/// local deadline timer, and the SSE handle. Whoever settles the slot first
/// owns the single active-counter decrement.
pub(crate) struct RequestSlot {
    settled: AtomicBool,
    sse: AtomicBool,
    active: Arc<AtomicUsize>,
}

impl RequestSlot {
    fn new(active: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            settled: AtomicBool::new(false),
            sse: AtomicBool::new(false),
            active,
        })
    }

    /// Returns `true` exactly once, for the first caller.
    pub(crate) fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_sse(&self) {
        self.sse.store(true, Ordering::SeqCst);
    }

    pub(crate) fn sse_started(&self) -> bool {
        self.sse.load(Ordering::SeqCst)
    }

    pub(crate) fn finish_active(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

type UriHandlerFuture = Pin<Box<dyn Future<Output = HandlerReply> + Send>>;
type UriHandlerFn = Arc<dyn Fn(WorkerRequest) -> UriHandlerFuture + Send + Sync>;

struct UriBinding {
    pattern: Regex,
    run: UriHandlerFn,
}

/// The child side of the spawnpool protocol.
pub struct WorkerRuntime {
    handler: Arc<dyn WorkerHandler>,
    uri_handlers: Vec<UriBinding>,
    emergency: CancellationToken,
}

impl WorkerRuntime {
    /// Create a runtime around the given handler.
    pub fn new(handler: impl WorkerHandler) -> Self {
        Self {
            handler: Arc::new(handler),
            uri_handlers: Vec::new(),
            emergency: CancellationToken::new(),
        }
    }

    /// Register a URI-matched request handler. On each `request` command the
    /// first registered pattern matching the request URI wins; requests that
    /// match none fall through to [`WorkerHandler::request`].
    ///
    /// # Errors
    ///
    /// Fails if `pattern` is not a valid regex.
    pub fn register_uri<F, Fut>(&mut self, pattern: &str, run: F) -> Result<(), WorkerError>
    where
        F: Fn(WorkerRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerReply> + Send + 'static,
    {
        let pattern = Regex::new(pattern).map_err(|e| WorkerError::Pattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        self.uri_handlers.push(UriBinding {
            pattern,
            run: Arc::new(move |req| Box::pin(run(req))),
        });
        Ok(())
    }

    /// Token that triggers emergency shutdown when cancelled. Wired to
    /// SIGTERM by [`WorkerRuntime::run_stdio`]; tests cancel it directly.
    pub fn emergency_token(&self) -> CancellationToken {
        self.emergency.clone()
    }

    /// Run over real stdio with signal and panic handling installed.
    ///
    /// Returns the process exit code: 0 for clean shutdown, 1 for emergency
    /// shutdown or a startup failure.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed.
    pub async fn run_stdio(self) -> anyhow::Result<i32> {
        // An uncaught panic anywhere in the worker triggers emergency
        // shutdown, like the parent-death signal.
        let panic_token = self.emergency.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            panic_token.cancel();
            previous(info);
        }));

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigint = signal(SignalKind::interrupt())?;
            tokio::spawn(async move {
                loop {
                    sigint.recv().await;
                    tracing::debug!("ignoring SIGINT (the parent owns it)");
                }
            });

            let mut sigterm = signal(SignalKind::terminate())?;
            let token = self.emergency.clone();
            tokio::spawn(async move {
                sigterm.recv().await;
                token.cancel();
            });
        }

        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Run the protocol loop over an arbitrary byte pipe.
    ///
    /// Consumes commands until `shutdown` (or EOF — the parent closing our
    /// stdin means the same thing), then drains in-flight requests, flushes
    /// the outbound stream, and runs the `shutdown` hook. Returns the exit
    /// code the process should report.
    ///
    /// # Errors
    ///
    /// Protocol-level failures are handled internally (logged, reflected in
    /// the exit code); only runtime-level wiring failures bubble up.
    pub async fn run<R, W>(self, reader: R, writer: W) -> anyhow::Result<i32>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let WorkerRuntime {
            handler,
            uri_handlers,
            emergency,
        } = self;

        let mut reader = FrameReader::new(reader);
        let writer: SharedWriter = Arc::new(Mutex::new(FrameWriter::new(
            Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>
        )));
        let ctx = Arc::new(RunCtx {
            handler,
            uri_handlers: Arc::new(uri_handlers),
            writer: writer.clone(),
            active: Arc::new(AtomicUsize::new(0)),
            request_timeout_sec: AtomicU64::new(0),
            compressor: OnceLock::new(),
        });

        loop {
            tokio::select! {
                _ = emergency.cancelled() => {
                    tracing::warn!("emergency shutdown signalled");
                    ctx.handler.emergency_shutdown().await;
                    return Ok(1);
                }
                next = reader.next::<Command>() => match next {
                    Ok(Some(cmd)) => match handle_command(&ctx, cmd).await {
                        Flow::Continue => {}
                        Flow::Drain => break,
                        Flow::Abort => return Ok(1),
                    },
                    Ok(None) => {
                        tracing::info!("command stream closed, draining");
                        break;
                    }
                    Err(ProtoError::Decode(e)) => {
                        tracing::warn!("discarding undecodable command frame: {e}");
                    }
                    Err(e) => {
                        tracing::error!("command stream failed: {e}");
                        break;
                    }
                }
            }
        }

        wait_idle(&ctx.active).await;
        {
            let mut w = writer.lock().await;
            if let Err(e) = w.shutdown().await {
                tracing::debug!("closing outbound stream: {e}");
            }
        }
        if let Err(e) = ctx.handler.shutdown().await {
            tracing::warn!("shutdown hook failed: {e:#}");
        }
        Ok(0)
    }
}

struct RunCtx {
    handler: Arc<dyn WorkerHandler>,
    uri_handlers: Arc<Vec<UriBinding>>,
    writer: SharedWriter,
    active: Arc<AtomicUsize>,
    request_timeout_sec: AtomicU64,
    compressor: OnceLock<Compressor>,
}

enum Flow {
    Continue,
    Drain,
    Abort,
}

async fn handle_command(ctx: &Arc<RunCtx>, cmd: Command) -> Flow {
    match cmd {
        Command::Startup { config, server } => {
            ctx.request_timeout_sec
                .store(config.request_timeout_sec, Ordering::SeqCst);
            let _ = ctx.compressor.set(Compressor::from_config(&config.compress));
            if let Err(e) = ctx.handler.startup(&config, &server).await {
                tracing::error!("startup hook failed: {e:#}");
                return Flow::Abort;
            }
            tracing::info!(host = %server.hostname, "worker ready");
            if let Err(e) = ctx.writer.lock().await.send(&Reply::StartupComplete).await {
                tracing::error!("failed to report startup completion: {e}");
                return Flow::Abort;
            }
            Flow::Continue
        }

        Command::Request(env) => {
            spawn_request(ctx.clone(), *env);
            Flow::Continue
        }

        Command::Custom { id, params } => {
            spawn_custom(ctx.clone(), id, params);
            Flow::Continue
        }

        Command::Maint { data } => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                wait_idle(&ctx.active).await;
                if let Err(e) = ctx.handler.maint(data).await {
                    tracing::warn!("maint hook failed: {e:#}");
                }
                if let Err(e) = ctx.writer.lock().await.send(&Reply::MaintComplete).await {
                    tracing::warn!("failed to report maint completion: {e}");
                }
            });
            Flow::Continue
        }

        Command::Message { data } => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.handler.message(data).await;
            });
            Flow::Continue
        }

        Command::Internal { data } => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Some(out) = ctx.handler.internal(data).await {
                    if let Err(e) = ctx
                        .writer
                        .lock()
                        .await
                        .send(&Reply::Internal { data: out })
                        .await
                    {
                        tracing::warn!("failed to send internal reply: {e}");
                    }
                }
            });
            Flow::Continue
        }

        Command::Shutdown => Flow::Drain,
    }
}

fn spawn_request(ctx: Arc<RunCtx>, env: RequestEnvelope) {
    ctx.active.fetch_add(1, Ordering::SeqCst);
    let slot = RequestSlot::new(ctx.active.clone());
    arm_deadline(&ctx, &env.id, slot.clone());

    tokio::spawn(async move {
        let started = Instant::now();
        let accept_encoding = env
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("accept-encoding"))
            .map(|(_, v)| v.clone());

        let request = WorkerRequest {
            envelope: env.clone(),
            sse: SseHandle::new(env.id.clone(), ctx.writer.clone(), slot.clone()),
        };

        let matched = ctx
            .uri_handlers
            .iter()
            .find(|binding| binding.pattern.is_match(&env.uri));
        let reply = match matched {
            Some(binding) => (binding.run)(request).await,
            None => ctx.handler.request(request).await,
        };

        if slot.sse_started() {
            // The stream ends through SseHandle::end, not the reply.
            return;
        }
        if !slot.settle() {
            tracing::debug!(id = %env.id, "request already aborted by deadline, dropping reply");
            return;
        }

        if let HandlerReply::Error(ref message) = reply {
            tracing::error!(id = %env.id, uri = %env.uri, "request handler failed: {message}");
        }
        let mut envelope = response::build_response(reply, &env);
        envelope.perf = Some(Perf {
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            counters: Default::default(),
        });
        if let Some(compressor) = ctx.compressor.get() {
            compressor.apply(&mut envelope, accept_encoding.as_deref());
        }
        if let Err(e) = ctx
            .writer
            .lock()
            .await
            .send(&Reply::Response(Box::new(envelope)))
            .await
        {
            tracing::warn!(id = %env.id, "failed to write response frame: {e}");
        }
        slot.finish_active();
    });
}

fn spawn_custom(ctx: Arc<RunCtx>, id: String, params: Value) {
    ctx.active.fetch_add(1, Ordering::SeqCst);
    let slot = RequestSlot::new(ctx.active.clone());
    arm_deadline(&ctx, &id, slot.clone());

    tokio::spawn(async move {
        let started = Instant::now();
        let result = ctx.handler.custom(params).await;
        if !slot.settle() {
            tracing::debug!(id = %id, "custom request already aborted by deadline");
            return;
        }

        let envelope = match result {
            Ok(value) => ResponseEnvelope {
                id: id.clone(),
                status: status::OK.to_string(),
                body_type: ResponseType::Passthrough,
                headers: Default::default(),
                body: ResponseBody::Text(
                    serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string()),
                ),
                perf: Some(Perf {
                    elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                    counters: Default::default(),
                }),
                log_error: None,
                delete: false,
            },
            Err(message) => {
                tracing::error!(id = %id, "custom handler failed: {message}");
                ResponseEnvelope::internal_error(&id, message)
            }
        };

        if let Err(e) = ctx
            .writer
            .lock()
            .await
            .send(&Reply::Response(Box::new(envelope)))
            .await
        {
            tracing::warn!(id = %id, "failed to write custom response frame: {e}");
        }
        slot.finish_active();
    });
}

/// Arm the worker-side half of the request deadline. The parent enforces the
/// same timeout; whichever side fires first wins, and a late handler
/// completion is discarded here without a response frame.
fn arm_deadline(ctx: &Arc<RunCtx>, id: &str, slot: Arc<RequestSlot>) {
    let secs = ctx.request_timeout_sec.load(Ordering::SeqCst);
    if secs == 0 {
        return;
    }
    let id = id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        if slot.settle() {
            tracing::warn!(id = %id, "request exceeded the {secs}s deadline, aborted locally");
            slot.finish_active();
        }
    });
}

async fn wait_idle(active: &AtomicUsize) {
    while active.load(Ordering::SeqCst) > 0 {
        tokio::time::sleep(DRAIN_POLL).await;
    }
}
