//! Parent-side representative of one child worker.
//!
//! A [`WorkerProxy`] owns the child's framed streams, its pending-request
//! table, and a small lifecycle state machine:
//!
//! ```text
//! startup → active → (active ↔ maint)* → shutdown → (child exit, removal)
//! ```
//!
//! Transitions are monotonic within one child life — a proxy never leaves
//! `shutdown`. Every pending request resolves exactly once: with the child's
//! response, a `504` from the request timer, or a `500` when the child exits
//! underneath it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use spawnpool_proto::{
    Command, FrameReader, FrameWriter, ProtoError, Reply, RequestEnvelope, ResponseBody,
    ResponseEnvelope, ResponseType, ServerInfo, encode_json_body,
};

use crate::config::PoolConfig;
use crate::error::{DispatchError, PoolError};
use crate::events::PoolEvent;
use crate::request::{DispatchBody, RequestOrigin, ResponseParts};
use crate::transport::{ChildTransport, PidRegistry, SpawnedChild};

/// Delay before unlinking a `delete`-flagged file response. The unlink never
/// blocks the response; the stream has already been handed off.
const FILE_DELETE_DELAY: Duration = Duration::from_millis(250);

/// Proxy lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Startup,
    Active,
    Maint,
    Shutdown,
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Startup => write!(f, "startup"),
            Self::Active => write!(f, "active"),
            Self::Maint => write!(f, "maint"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Shared wiring a pool hands to each proxy it spawns.
#[derive(Clone)]
pub(crate) struct ProxyContext {
    pub pool_id: String,
    pub config: Arc<ArcSwap<PoolConfig>>,
    pub server: ServerInfo,
    pub pool_active: Arc<AtomicUsize>,
    pub events: broadcast::Sender<PoolEvent>,
    pub exited_tx: mpsc::UnboundedSender<u32>,
    pub registry: PidRegistry,
}

struct PendingRequest {
    responder: oneshot::Sender<ResponseParts>,
    origin: RequestOrigin,
    timeout: Option<JoinHandle<()>>,
    sse_sink: Option<mpsc::UnboundedSender<String>>,
    custom: bool,
}

#[derive(Default)]
struct Timers {
    startup: Option<JoinHandle<()>>,
    maint: Option<JoinHandle<()>>,
    kill: Option<JoinHandle<()>>,
}

type SharedWriter = Arc<Mutex<FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>>>;

/// Parent-side handle to one child worker.
pub struct WorkerProxy {
    pid: u32,
    ctx: ProxyContext,
    is_process: bool,

    state: StdMutex<ProxyState>,
    active: AtomicUsize,
    served: AtomicU64,
    /// Resolved per-worker request budget; 0 disables recycling.
    budget: AtomicU64,
    last_maint_served: AtomicU64,
    last_maint_at: StdMutex<Instant>,
    request_maint: StdMutex<Option<Value>>,
    request_restart: AtomicBool,
    child_exited: AtomicBool,

    pending: Mutex<HashMap<String, PendingRequest>>,
    writer: SharedWriter,
    process: Arc<Mutex<Option<tokio::process::Child>>>,
    timers: StdMutex<Timers>,
    startup_waiter: StdMutex<Option<oneshot::Sender<Result<(), PoolError>>>>,
    stdout: StdMutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    stderr: StdMutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
}

impl std::fmt::Debug for WorkerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProxy")
            .field("pid", &self.pid)
            .field("pool", &self.ctx.pool_id)
            .field("state", &self.state())
            .field("active", &self.num_active_requests())
            .field("served", &self.num_requests_served())
            .finish_non_exhaustive()
    }
}

impl WorkerProxy {
    /// Spawn the child via the transport and build its proxy. The proxy is
    /// inert until [`WorkerProxy::start`] — the pool registers it in its pid
    /// map first, so a child that dies instantly still gets removed.
    ///
    /// Returns the proxy and a receiver resolving when the child reports
    /// `startup_complete` (or fails to).
    pub(crate) async fn spawn(
        ctx: ProxyContext,
        transport: &dyn ChildTransport,
    ) -> Result<(Arc<Self>, oneshot::Receiver<Result<(), PoolError>>), PoolError> {
        let cfg = ctx.config.load_full();
        let SpawnedChild {
            pid,
            stdin,
            stdout,
            stderr,
            process,
            is_process,
        } = transport.spawn(&cfg).await?;

        let budget = cfg.max_requests_per_child.resolve(&mut rand::thread_rng());
        let (ready_tx, ready_rx) = oneshot::channel();

        if is_process {
            ctx.registry.insert(pid);
        }

        let proxy = Arc::new(Self {
            pid,
            ctx,
            is_process,
            state: StdMutex::new(ProxyState::Startup),
            active: AtomicUsize::new(0),
            served: AtomicU64::new(0),
            budget: AtomicU64::new(budget),
            last_maint_served: AtomicU64::new(0),
            last_maint_at: StdMutex::new(Instant::now()),
            request_maint: StdMutex::new(None),
            request_restart: AtomicBool::new(false),
            child_exited: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            writer: Arc::new(Mutex::new(FrameWriter::new(stdin))),
            process,
            timers: StdMutex::new(Timers::default()),
            startup_waiter: StdMutex::new(Some(ready_tx)),
            stdout: StdMutex::new(Some(stdout)),
            stderr: StdMutex::new(stderr),
        });

        Ok((proxy, ready_rx))
    }

    /// Wire up the reader loop and stderr pump, send the `startup` frame,
    /// and arm the startup timer.
    pub(crate) async fn start(self: &Arc<Self>) {
        let cfg = self.ctx.config.load_full();

        if let Some(stderr) = self.stderr.lock().expect("stderr slot poisoned").take() {
            let pid = self.pid;
            let pool = self.ctx.pool_id.clone();
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(pid, pool = %pool, "{line}");
                }
            });
        }

        let stdout = self
            .stdout
            .lock()
            .expect("stdout slot poisoned")
            .take()
            .expect("start called twice");
        let reader_proxy = Arc::clone(self);
        tokio::spawn(async move {
            reader_proxy.read_loop(FrameReader::new(stdout)).await;
        });

        // First frame out: the pool config and a trimmed view of the host.
        let startup = Command::Startup {
            config: cfg.worker_boot_config(),
            server: self.ctx.server.clone(),
        };
        if let Err(e) = self.writer.lock().await.send(&startup).await {
            tracing::error!(pid = self.pid, "failed to write startup frame: {e}");
            self.handle_child_gone(format!("failed to write startup frame: {e}"))
                .await;
            return;
        }

        let secs = cfg.startup_timeout_sec;
        if secs > 0 {
            let proxy = Arc::clone(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                tracing::warn!(pid = proxy.pid, "worker startup timed out after {secs}s, killing");
                if let Some(tx) = proxy
                    .startup_waiter
                    .lock()
                    .expect("startup waiter poisoned")
                    .take()
                {
                    let _ = tx.send(Err(PoolError::StartupTimeout(secs)));
                }
                proxy.kill().await;
            });
            self.timers.lock().expect("timers poisoned").startup = Some(timer);
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock().expect("state poisoned")
    }

    pub fn num_active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn num_requests_served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    /// The resolved `max_requests_per_child` for this worker.
    pub fn request_budget(&self) -> u64 {
        self.budget.load(Ordering::SeqCst)
    }

    /// Overwrite the resolved request budget. Range randomisation happens
    /// once at spawn; this is the explicit hot-edit path.
    pub fn set_request_budget(&self, budget: u64) {
        self.budget.store(budget, Ordering::SeqCst);
    }

    pub(crate) fn last_maint_served(&self) -> u64 {
        self.last_maint_served.load(Ordering::SeqCst)
    }

    pub(crate) fn last_maint_elapsed(&self) -> Duration {
        self.last_maint_at
            .lock()
            .expect("last_maint poisoned")
            .elapsed()
    }

    pub(crate) fn mark_maint_baseline(&self) {
        self.last_maint_served
            .store(self.served.load(Ordering::SeqCst), Ordering::SeqCst);
        *self.last_maint_at.lock().expect("last_maint poisoned") = Instant::now();
    }

    pub(crate) fn set_request_maint(&self, payload: Value) {
        *self.request_maint.lock().expect("request_maint poisoned") = Some(payload);
    }

    pub(crate) fn take_request_maint(&self) -> Option<Value> {
        self.request_maint
            .lock()
            .expect("request_maint poisoned")
            .take()
    }

    pub(crate) fn set_request_restart(&self) {
        self.request_restart.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_request_restart(&self) -> bool {
        self.request_restart.swap(false, Ordering::SeqCst)
    }

    fn transition(&self, to: ProxyState) {
        let mut state = self.state.lock().expect("state poisoned");
        // Shutdown is terminal within one child life.
        if *state == ProxyState::Shutdown && to != ProxyState::Shutdown {
            return;
        }
        if *state != to {
            tracing::debug!(pid = self.pid, from = %state, to = %to, "worker state change");
            *state = to;
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Send one request to the child. Counters and the pending entry are
    /// registered before the frame is written, so the response (or failure)
    /// path always finds them.
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        envelope: RequestEnvelope,
        origin: RequestOrigin,
        sse_sink: Option<mpsc::UnboundedSender<String>>,
        responder: oneshot::Sender<ResponseParts>,
    ) {
        self.send_work(envelope.id.clone(), Command::Request(Box::new(envelope)), origin, sse_sink, false, responder)
            .await;
    }

    /// Send one custom (non-HTTP) request to the child.
    pub(crate) async fn dispatch_custom(
        self: &Arc<Self>,
        id: String,
        params: Value,
        responder: oneshot::Sender<ResponseParts>,
    ) {
        let origin = RequestOrigin {
            method: "CUSTOM".to_string(),
            uri: String::new(),
            query: Default::default(),
        };
        let command = Command::Custom {
            id: id.clone(),
            params,
        };
        self.send_work(id, command, origin, None, true, responder).await;
    }

    async fn send_work(
        self: &Arc<Self>,
        id: String,
        command: Command,
        origin: RequestOrigin,
        sse_sink: Option<mpsc::UnboundedSender<String>>,
        custom: bool,
        responder: oneshot::Sender<ResponseParts>,
    ) {
        if self.state() == ProxyState::Shutdown {
            let _ = responder.send(ResponseParts::failure(DispatchError::NoWorkerAvailable(
                format!("worker {} is shutting down", self.pid),
            )));
            return;
        }

        let cfg = self.ctx.config.load_full();
        self.active.fetch_add(1, Ordering::SeqCst);
        self.ctx.pool_active.fetch_add(1, Ordering::SeqCst);
        self.served.fetch_add(1, Ordering::SeqCst);

        let timeout = self.arm_request_timeout(&id, cfg.request_timeout_sec);
        self.pending.lock().await.insert(
            id.clone(),
            PendingRequest {
                responder,
                origin,
                timeout,
                sse_sink,
                custom,
            },
        );

        if let Err(e) = self.writer.lock().await.send(&command).await {
            tracing::warn!(pid = self.pid, id = %id, "failed to write request frame: {e}");
            if let Some(entry) = self.pending.lock().await.remove(&id) {
                if let Some(timer) = entry.timeout {
                    timer.abort();
                }
                self.finish_request();
                let _ = entry.responder.send(ResponseParts::failure(
                    DispatchError::ChildCrashed(format!("failed to write request frame: {e}")),
                ));
            }
        }
    }

    fn arm_request_timeout(self: &Arc<Self>, id: &str, secs: u64) -> Option<JoinHandle<()>> {
        if secs == 0 {
            return None;
        }
        let proxy = Arc::clone(self);
        let id = id.to_string();
        Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let entry = proxy.pending.lock().await.remove(&id);
            if let Some(entry) = entry {
                tracing::warn!(pid = proxy.pid, id = %id, "request timed out after {secs}s");
                proxy.finish_request();
                let _ = entry
                    .responder
                    .send(ResponseParts::failure(DispatchError::RequestTimeout(secs)));
            }
        }))
    }

    fn finish_request(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.ctx.pool_active.fetch_sub(1, Ordering::SeqCst);
    }

    // ── Control operations ───────────────────────────────────────────────────

    /// Ask the child to perform maintenance. The proxy leaves serving
    /// rotation (`maint` state) until `maint_complete` comes back; the maint
    /// timer escalates to shutdown.
    pub(crate) async fn maint(self: &Arc<Self>, data: Value) {
        let cfg = self.ctx.config.load_full();
        self.transition(ProxyState::Maint);
        if let Err(e) = self.writer.lock().await.send(&Command::Maint { data }).await {
            tracing::warn!(pid = self.pid, "failed to write maint frame: {e}");
            return;
        }
        let secs = cfg.maint_timeout_sec;
        if secs > 0 {
            let proxy = Arc::clone(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                tracing::warn!(
                    pid = proxy.pid,
                    "maintenance timed out after {secs}s, shutting worker down"
                );
                proxy.shutdown().await;
            });
            self.timers.lock().expect("timers poisoned").maint = Some(timer);
        }
    }

    /// Write a broadcast `message` frame to the child.
    pub(crate) async fn send_message(&self, data: Value) {
        if let Err(e) = self
            .writer
            .lock()
            .await
            .send(&Command::Message { data })
            .await
        {
            tracing::warn!(pid = self.pid, "failed to write message frame: {e}");
        }
    }

    /// Write an `internal` (debug-channel) frame to the child.
    pub(crate) async fn send_internal(&self, data: Value) {
        if let Err(e) = self
            .writer
            .lock()
            .await
            .send(&Command::Internal { data })
            .await
        {
            tracing::warn!(pid = self.pid, "failed to write internal frame: {e}");
        }
    }

    /// Begin shutdown: send the `shutdown` frame, end the outbound stream,
    /// and arm the kill timer. Pending requests are left to complete or fail
    /// when the child exits. Idempotent.
    pub(crate) async fn shutdown(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("state poisoned");
            if *state == ProxyState::Shutdown {
                return;
            }
            *state = ProxyState::Shutdown;
        }
        tracing::info!(pid = self.pid, pool = %self.ctx.pool_id, "shutting worker down");

        {
            let mut timers = self.timers.lock().expect("timers poisoned");
            if let Some(t) = timers.startup.take() {
                t.abort();
            }
            if let Some(t) = timers.maint.take() {
                t.abort();
            }
        }

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(&Command::Shutdown).await {
                tracing::debug!(pid = self.pid, "shutdown frame not written: {e}");
            }
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(pid = self.pid, "outbound stream close: {e}");
            }
        }

        let secs = self.ctx.config.load_full().shutdown_timeout_sec;
        if secs > 0 {
            let proxy = Arc::clone(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                if !proxy.child_exited.load(Ordering::SeqCst) {
                    tracing::warn!(
                        pid = proxy.pid,
                        "worker ignored shutdown for {secs}s, killing"
                    );
                    proxy.kill().await;
                }
            });
            self.timers.lock().expect("timers poisoned").kill = Some(timer);
        }
    }

    /// SIGKILL the real child process. Mock children have no process; they
    /// terminate when their streams close.
    pub(crate) async fn kill(&self) {
        if let Some(mut child) = self.process.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(pid = self.pid, "kill failed: {e}");
            }
        }
    }

    // ── Frame intake ─────────────────────────────────────────────────────────

    async fn read_loop(
        self: Arc<Self>,
        mut reader: FrameReader<Box<dyn AsyncRead + Send + Unpin>>,
    ) {
        loop {
            match reader.next::<Reply>().await {
                Ok(Some(reply)) => self.handle_reply(reply).await,
                Ok(None) => {
                    self.handle_child_gone("child closed its output stream".to_string())
                        .await;
                    break;
                }
                Err(ProtoError::Decode(e)) => {
                    tracing::warn!(pid = self.pid, "discarding undecodable frame: {e}");
                }
                Err(e) => {
                    self.handle_child_gone(format!("stream error: {e}")).await;
                    break;
                }
            }
        }
    }

    async fn handle_reply(self: &Arc<Self>, reply: Reply) {
        match reply {
            Reply::StartupComplete => {
                if let Some(t) = self.timers.lock().expect("timers poisoned").startup.take() {
                    t.abort();
                }
                if self.state() == ProxyState::Startup {
                    self.transition(ProxyState::Active);
                }
                if let Some(tx) = self
                    .startup_waiter
                    .lock()
                    .expect("startup waiter poisoned")
                    .take()
                {
                    let _ = tx.send(Ok(()));
                }
                tracing::info!(pid = self.pid, pool = %self.ctx.pool_id, "worker active");
            }

            Reply::MaintComplete => {
                if let Some(t) = self.timers.lock().expect("timers poisoned").maint.take() {
                    t.abort();
                }
                if self.state() == ProxyState::Maint {
                    self.transition(ProxyState::Active);
                }
                tracing::debug!(pid = self.pid, "maintenance complete");
            }

            Reply::Message { data } => {
                let _ = self.ctx.events.send(PoolEvent::Message {
                    pid: self.pid,
                    data,
                });
            }

            Reply::Internal { data } => {
                let _ = self.ctx.events.send(PoolEvent::Internal {
                    pid: self.pid,
                    data,
                });
            }

            Reply::Sse { id, chunk } => {
                let pending = self.pending.lock().await;
                match pending.get(&id).and_then(|p| p.sse_sink.as_ref()) {
                    Some(sink) => {
                        let _ = sink.send(chunk);
                    }
                    None => {
                        tracing::debug!(pid = self.pid, id = %id, "sse chunk with no sink, dropped");
                    }
                }
            }

            Reply::Response(envelope) => self.complete_request(*envelope).await,
        }
    }

    async fn complete_request(self: &Arc<Self>, envelope: ResponseEnvelope) {
        let Some(mut entry) = self.pending.lock().await.remove(&envelope.id) else {
            // Late completion after a timeout, or a duplicate id: the entry
            // was removed on first resolution.
            tracing::debug!(pid = self.pid, id = %envelope.id, "unmatched response, discarded");
            return;
        };
        if let Some(timer) = entry.timeout.take() {
            timer.abort();
        }
        if let Some(log_error) = &envelope.log_error {
            tracing::error!(
                pid = self.pid,
                id = %envelope.id,
                method = %entry.origin.method,
                uri = %entry.origin.uri,
                "worker reported error: {log_error}"
            );
        }

        let parts = self.response_to_parts(envelope, &entry).await;
        self.finish_request();
        let _ = entry.responder.send(parts);
    }

    async fn response_to_parts(
        &self,
        envelope: ResponseEnvelope,
        entry: &PendingRequest,
    ) -> ResponseParts {
        let ResponseEnvelope {
            id,
            status: status_line,
            body_type,
            mut headers,
            body,
            perf,
            delete,
            ..
        } = envelope;

        if body_type == ResponseType::File {
            let ResponseBody::Text(path) = body else {
                return ResponseParts::failure(DispatchError::FileResponse(
                    "response carried no file path".to_string(),
                ));
            };
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::error!(pid = self.pid, id = %id, "file response stat failed: {e}");
                    return ResponseParts::failure(DispatchError::FileResponse(format!(
                        "failed to stat {path}: {e}"
                    )));
                }
            };
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    return ResponseParts::failure(DispatchError::FileResponse(format!(
                        "failed to open {path}: {e}"
                    )));
                }
            };
            headers.insert("Content-Length".to_string(), meta.len().to_string());
            if delete {
                let path = path.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(FILE_DELETE_DELAY).await;
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        tracing::warn!("failed to unlink served file {path}: {e}");
                    }
                });
            }
            return ResponseParts {
                status: status_line,
                headers,
                body: DispatchBody::Stream(Box::new(file)),
                perf,
            };
        }

        let mut body = match body {
            ResponseBody::Text(s) => DispatchBody::Text(s),
            ResponseBody::Binary(b) => DispatchBody::Binary(b),
            ResponseBody::Empty => DispatchBody::Empty,
        };

        // Mirror the worker's JSON/JSONP encoding for bodies the worker
        // passed through raw (custom handlers excepted — their payload goes
        // back to a programmatic caller verbatim).
        if !entry.custom {
            post_process_json(&mut headers, &mut body, &entry.origin.query);
        }

        ResponseParts {
            status: status_line,
            headers,
            body,
            perf,
        }
    }

    // ── Child exit ───────────────────────────────────────────────────────────

    /// Handle the child disappearing (EOF or stream error). Runs once per
    /// child life: fails every pending request with a 500, resolves a
    /// not-yet-complete startup, and notifies the pool for removal.
    pub(crate) async fn handle_child_gone(self: &Arc<Self>, cause: String) {
        if self.child_exited.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(pid = self.pid, pool = %self.ctx.pool_id, "worker gone: {cause}");
        self.transition(ProxyState::Shutdown);

        {
            let mut timers = self.timers.lock().expect("timers poisoned");
            for timer in [timers.startup.take(), timers.maint.take(), timers.kill.take()]
                .into_iter()
                .flatten()
            {
                timer.abort();
            }
        }

        if self.is_process {
            self.ctx.registry.remove(self.pid);
        }

        // Reap the real process off the exit path; pending-failure fan-out
        // must not wait on wait().
        let process = Arc::clone(&self.process);
        let pid = self.pid;
        tokio::spawn(async move {
            if let Some(mut child) = process.lock().await.take() {
                match child.wait().await {
                    Ok(exit) => tracing::info!(pid, "worker exited: {exit}"),
                    Err(e) => tracing::warn!(pid, "failed to reap worker: {e}"),
                }
            }
        });

        let startup_error = self
            .startup_waiter
            .lock()
            .expect("startup waiter poisoned")
            .take();
        if let Some(tx) = startup_error {
            let _ = tx.send(Err(PoolError::StartupFailed(cause.clone())));
        }

        let entries: Vec<(String, PendingRequest)> =
            self.pending.lock().await.drain().collect();
        for (id, mut entry) in entries {
            if let Some(timer) = entry.timeout.take() {
                timer.abort();
            }
            tracing::warn!(pid = self.pid, id = %id, "failing request: worker exited");
            self.finish_request();
            let _ = entry
                .responder
                .send(ResponseParts::failure(DispatchError::ChildCrashed(
                    cause.clone(),
                )));
        }

        let _ = self.ctx.exited_tx.send(self.pid);
    }
}

/// Re-encode a raw JSON body per the request's `pretty`/`callback` query
/// parameters when the worker did not already do so.
fn post_process_json(
    headers: &mut std::collections::BTreeMap<String, String>,
    body: &mut DispatchBody,
    query: &std::collections::BTreeMap<String, String>,
) {
    if !query.contains_key("callback") && !query.contains_key("pretty") {
        return;
    }
    let content_type = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.as_str())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        return;
    }
    let DispatchBody::Text(text) = body else {
        return;
    };
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let (encoded, content_type) = encode_json_body(&value, query);
    // Only rewrite when the encoding actually changed the representation.
    if encoded != *text {
        headers.insert("Content-Type".to_string(), content_type.to_string());
        *body = DispatchBody::Text(encoded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_proxy_state_display() {
        assert_eq!(ProxyState::Startup.to_string(), "startup");
        assert_eq!(ProxyState::Active.to_string(), "active");
        assert_eq!(ProxyState::Maint.to_string(), "maint");
        assert_eq!(ProxyState::Shutdown.to_string(), "shutdown");
    }

    #[test]
    fn test_post_process_wraps_jsonp() {
        let mut headers =
            BTreeMap::from([("Content-Type".to_string(), "application/json".to_string())]);
        let mut body = DispatchBody::Text(r#"{"n":1}"#.to_string());
        let query = BTreeMap::from([("callback".to_string(), "cb".to_string())]);

        post_process_json(&mut headers, &mut body, &query);
        assert_eq!(body.as_text(), Some(r#"cb({"n":1});"#));
        assert_eq!(headers["Content-Type"], "text/javascript");
    }

    #[test]
    fn test_post_process_pretty_prints() {
        let mut headers =
            BTreeMap::from([("Content-Type".to_string(), "application/json".to_string())]);
        let mut body = DispatchBody::Text(r#"{"n":1}"#.to_string());
        let query = BTreeMap::from([("pretty".to_string(), "1".to_string())]);

        post_process_json(&mut headers, &mut body, &query);
        assert!(body.as_text().unwrap().contains('\n'));
    }

    #[test]
    fn test_post_process_skips_non_json() {
        let mut headers =
            BTreeMap::from([("Content-Type".to_string(), "text/html".to_string())]);
        let mut body = DispatchBody::Text("<p>hi</p>".to_string());
        let query = BTreeMap::from([("callback".to_string(), "cb".to_string())]);

        post_process_json(&mut headers, &mut body, &query);
        assert_eq!(body.as_text(), Some("<p>hi</p>"));
    }

    #[test]
    fn test_post_process_skips_without_query_hints() {
        let mut headers =
            BTreeMap::from([("Content-Type".to_string(), "application/json".to_string())]);
        let mut body = DispatchBody::Text(r#"{"n":1}"#.to_string());
        post_process_json(&mut headers, &mut body, &BTreeMap::new());
        assert_eq!(body.as_text(), Some(r#"{"n":1}"#));
    }
}
