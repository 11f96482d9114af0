//! A pool of interchangeable child workers sharing one configuration.
//!
//! The pool owns dispatch policy (least-loaded with random tie-break, a
//! pool-wide concurrency cap), per-tick control decisions (auto-maint,
//! end-of-life recycle, rolling restart, auto-scaling), broadcast
//! operations, and startup/shutdown sequencing. All mutations of the pid map
//! are serialised through one async mutex; per-request counters are atomics
//! kept consistent by the proxies.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore, broadcast, mpsc, oneshot};

use spawnpool_proto::{Perf, ServerInfo, status};

use crate::config::{MaintMethod, PoolConfig};
use crate::error::{CustomError, DispatchError, PoolError};
use crate::events::{PoolEvent, ScaleAction};
use crate::id::IdGenerator;
use crate::proxy::{ProxyContext, ProxyState, WorkerProxy};
use crate::request::{RequestArgs, ResponseParts};
use crate::transport::{ChildTransport, PidRegistry};

/// Capacity of the pool event broadcast channel.
const EVENT_CAPACITY: usize = 64;

/// Poll interval while waiting for the pid map to drain on shutdown.
const DRAIN_POLL: Duration = Duration::from_millis(25);

struct PoolInner {
    proxies: HashMap<u32, Arc<WorkerProxy>>,
    /// Round-robin focus cursor for tick decisions.
    cursor: usize,
}

/// Snapshot of proxy states taken at the start of a tick and used
/// consistently within it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub startup: usize,
    pub active: usize,
    pub maint: usize,
    pub shutdown: usize,
}

impl StateCounts {
    fn of<'a>(proxies: impl Iterator<Item = &'a Arc<WorkerProxy>>) -> Self {
        let mut counts = Self::default();
        for proxy in proxies {
            match proxy.state() {
                ProxyState::Startup => counts.startup += 1,
                ProxyState::Active => counts.active += 1,
                ProxyState::Maint => counts.maint += 1,
                ProxyState::Shutdown => counts.shutdown += 1,
            }
        }
        counts
    }
}

/// A named set of child workers behind one config.
pub struct WorkerPool {
    id: String,
    config: Arc<ArcSwap<PoolConfig>>,
    transport: Arc<dyn ChildTransport>,
    server: ServerInfo,
    ids: Arc<IdGenerator>,
    registry: PidRegistry,
    inner: Mutex<PoolInner>,
    active: Arc<AtomicUsize>,
    events: broadcast::Sender<PoolEvent>,
    exited_tx: mpsc::UnboundedSender<u32>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("active_requests", &self.num_active_requests())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Build a pool. No children are spawned until [`WorkerPool::startup`].
    pub fn new(
        id: impl Into<String>,
        config: PoolConfig,
        transport: Arc<dyn ChildTransport>,
        ids: Arc<IdGenerator>,
        server: ServerInfo,
        registry: PidRegistry,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (exited_tx, mut exited_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(Self {
            id: id.into(),
            config: Arc::new(ArcSwap::from_pointee(config)),
            transport,
            server,
            ids,
            registry,
            inner: Mutex::new(PoolInner {
                proxies: HashMap::new(),
                cursor: 0,
            }),
            active: Arc::new(AtomicUsize::new(0)),
            events,
            exited_tx,
            shutting_down: AtomicBool::new(false),
        });

        // Exit pump: a proxy reports its pid here once the child is observed
        // gone; only then is it discarded from the pool.
        let weak = Arc::downgrade(&pool);
        tokio::spawn(async move {
            while let Some(pid) = exited_rx.recv().await {
                let Some(pool) = weak.upgrade() else { break };
                let removed = pool.inner.lock().await.proxies.remove(&pid).is_some();
                if removed {
                    tracing::info!(pool = %pool.id, pid, "worker removed from pool");
                }
            }
        });

        pool
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current config snapshot.
    pub fn config(&self) -> Arc<PoolConfig> {
        self.config.load_full()
    }

    /// Hot-swap the pool config. Ticks and dispatches each load one
    /// consistent snapshot; live workers keep their resolved request
    /// budgets (see [`WorkerPool::set_request_budget`]).
    ///
    /// # Errors
    ///
    /// Rejects configs that fail validation.
    pub fn set_config(&self, config: PoolConfig) -> Result<(), PoolError> {
        config.validate()?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Pool-wide in-flight request count.
    pub fn num_active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Sorted pids of all tracked workers.
    pub async fn workers(&self) -> Vec<u32> {
        let inner = self.inner.lock().await;
        let mut pids: Vec<u32> = inner.proxies.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Handle to one worker's proxy, if it is still tracked.
    pub async fn worker(&self, pid: u32) -> Option<Arc<WorkerProxy>> {
        self.inner.lock().await.proxies.get(&pid).cloned()
    }

    /// Overwrite one worker's resolved request budget (the explicit hot-edit
    /// path; spawn-time range randomisation is never redone).
    pub async fn set_request_budget(&self, pid: u32, budget: u64) -> bool {
        match self.worker(pid).await {
            Some(proxy) => {
                proxy.set_request_budget(budget);
                true
            }
            None => false,
        }
    }

    // ── Startup / worker launch ──────────────────────────────────────────────

    /// Spawn `min_children` workers with launch parallelism bounded by
    /// `max_concurrent_launches`, and wait for every one to report ready.
    ///
    /// # Errors
    ///
    /// A spawn failure, startup timeout, or early exit of any initial worker
    /// fails pool startup; already-started workers are shut down.
    pub async fn startup(self: &Arc<Self>) -> Result<(), PoolError> {
        let cfg = self.config.load_full();
        cfg.validate()?;

        let semaphore = Arc::new(Semaphore::new(cfg.max_concurrent_launches));
        let mut waits = Vec::with_capacity(cfg.min_children);

        for _ in 0..cfg.min_children {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("launch semaphore closed");
            let launch = {
                let mut inner = self.inner.lock().await;
                self.launch_worker_locked(&mut inner).await
            };
            let ready = match launch {
                Ok((_proxy, ready)) => ready,
                Err(e) => {
                    drop(permit);
                    self.shutdown().await;
                    return Err(e);
                }
            };
            waits.push(tokio::spawn(async move {
                let result = match ready.await {
                    Ok(result) => result,
                    Err(_) => Err(PoolError::StartupFailed("startup signal dropped".into())),
                };
                drop(permit);
                result
            }));
        }

        let mut first_err: Option<PoolError> = None;
        for wait in waits {
            match wait.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err
                        .get_or_insert(PoolError::StartupFailed(format!("startup task: {e}")));
                }
            }
        }
        if let Some(e) = first_err {
            self.shutdown().await;
            return Err(e);
        }

        tracing::info!(pool = %self.id, workers = cfg.min_children, "pool started");
        Ok(())
    }

    /// Add one worker (used by scale-up and tests). Does not wait for the
    /// child to report ready; it serves once `startup_complete` arrives.
    ///
    /// # Errors
    ///
    /// [`PoolError::SpawnFailed`] when the transport cannot start a child.
    pub async fn add_worker(self: &Arc<Self>) -> Result<u32, PoolError> {
        let mut inner = self.inner.lock().await;
        let (proxy, _ready) = self.launch_worker_locked(&mut inner).await?;
        Ok(proxy.pid())
    }

    async fn launch_worker_locked(
        self: &Arc<Self>,
        inner: &mut PoolInner,
    ) -> Result<(Arc<WorkerProxy>, oneshot::Receiver<Result<(), PoolError>>), PoolError> {
        let ctx = ProxyContext {
            pool_id: self.id.clone(),
            config: Arc::clone(&self.config),
            server: self.server.clone(),
            pool_active: Arc::clone(&self.active),
            events: self.events.clone(),
            exited_tx: self.exited_tx.clone(),
            registry: self.registry.clone(),
        };
        let (proxy, ready) = WorkerProxy::spawn(ctx, self.transport.as_ref()).await?;
        // Register before the reader starts so an instantly-dying child is
        // still removed through the exit pump.
        inner.proxies.insert(proxy.pid(), Arc::clone(&proxy));
        proxy.start().await;
        tracing::info!(pool = %self.id, pid = proxy.pid(), "worker launched");
        Ok((proxy, ready))
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Dispatch one request. Always resolves exactly once:
    ///
    /// - `429 Too Many Requests` when the pool-wide cap is hit,
    /// - `503 Service Unavailable` when no worker is in `active` state,
    /// - `504 Gateway Timeout` when `request_timeout_sec` expires,
    /// - `500 Internal Server Error` when the child exits mid-request,
    /// - otherwise the worker's response.
    pub async fn dispatch(&self, args: RequestArgs) -> ResponseParts {
        let cfg = self.config.load_full();
        if cfg.max_concurrent_requests > 0
            && self.active.load(Ordering::SeqCst) >= cfg.max_concurrent_requests
        {
            tracing::warn!(pool = %self.id, uri = %args.uri, "pool concurrency cap reached");
            return ResponseParts::failure(DispatchError::CapExceeded {
                pool: self.id.clone(),
                limit: cfg.max_concurrent_requests,
            });
        }

        let proxy = {
            let inner = self.inner.lock().await;
            pick_least_loaded(&inner.proxies)
        };
        let Some(proxy) = proxy else {
            tracing::warn!(pool = %self.id, uri = %args.uri, "no active worker available");
            return ResponseParts::failure(DispatchError::NoWorkerAvailable(format!(
                "pool {} has no active worker",
                self.id
            )));
        };

        let id = self.ids.next("r");
        let (envelope, origin, sse_sink) = args.into_wire(id);
        let (tx, rx) = oneshot::channel();
        proxy.dispatch(envelope, origin, sse_sink, tx).await;
        match rx.await {
            Ok(parts) => parts,
            Err(_) => ResponseParts::failure(DispatchError::ChildCrashed(
                "request resolution dropped".to_string(),
            )),
        }
    }

    /// Dispatch a custom (non-HTTP) request and return the worker's decoded
    /// payload plus performance metrics.
    ///
    /// # Errors
    ///
    /// [`CustomError`] whose `code` is the status line — `429`/`503`
    /// rejections, or any non-2xx the worker answered.
    pub async fn dispatch_custom(&self, params: Value) -> Result<(Value, Perf), CustomError> {
        let cfg = self.config.load_full();
        if cfg.max_concurrent_requests > 0
            && self.active.load(Ordering::SeqCst) >= cfg.max_concurrent_requests
        {
            return Err(CustomError::from(DispatchError::CapExceeded {
                pool: self.id.clone(),
                limit: cfg.max_concurrent_requests,
            }));
        }
        let proxy = {
            let inner = self.inner.lock().await;
            pick_least_loaded(&inner.proxies)
        };
        let Some(proxy) = proxy else {
            return Err(CustomError::from(DispatchError::NoWorkerAvailable(
                format!("pool {} has no active worker", self.id),
            )));
        };

        let started = Instant::now();
        let id = self.ids.next("c");
        let (tx, rx) = oneshot::channel();
        proxy.dispatch_custom(id, params, tx).await;
        let parts = rx.await.map_err(|_| {
            CustomError::from(DispatchError::ChildCrashed(
                "request resolution dropped".to_string(),
            ))
        })?;

        if !status::is_success(&parts.status) {
            return Err(CustomError {
                code: parts.status,
                message: parts.body.as_text().unwrap_or_default().to_string(),
            });
        }
        let value = parts
            .body
            .as_text()
            .and_then(|text| serde_json::from_str(text).ok())
            .unwrap_or(Value::Null);
        let mut perf = parts.perf.unwrap_or_default();
        perf.counters.insert(
            "dispatch_ms".to_string(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        Ok((value, perf))
    }

    // ── Tick ─────────────────────────────────────────────────────────────────

    /// One second of control-loop work. Focuses on a single rotating worker
    /// for maintenance/recycle/restart decisions, then considers one
    /// pool-wide auto-scale action.
    pub async fn tick(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let cfg = self.config.load_full();
        let mut inner = self.inner.lock().await;
        if inner.proxies.is_empty() {
            return;
        }

        let mut pids: Vec<u32> = inner.proxies.keys().copied().collect();
        pids.sort_unstable();
        let counts = StateCounts::of(inner.proxies.values());

        let focus_pid = pids[inner.cursor % pids.len()];
        inner.cursor = inner.cursor.wrapping_add(1);
        let focus = Arc::clone(&inner.proxies[&focus_pid]);

        // Maintenance decision.
        if counts.maint < cfg.max_concurrent_maint
            && counts.active > 1
            && focus.state() == ProxyState::Active
        {
            let mut payload: Option<Value> = None;
            if cfg.auto_maint {
                let due = match cfg.maint_method {
                    MaintMethod::Requests => {
                        focus
                            .num_requests_served()
                            .saturating_sub(focus.last_maint_served())
                            >= cfg.maint_requests
                    }
                    MaintMethod::Time => {
                        focus.last_maint_elapsed() >= Duration::from_secs(cfg.maint_time_sec)
                    }
                };
                if due {
                    payload = Some(Value::Null);
                }
            }
            if let Some(requested) = focus.take_request_maint() {
                payload = Some(requested);
            }
            if let Some(data) = payload {
                tracing::info!(pool = %self.id, pid = focus_pid, "sending worker to maintenance");
                focus.mark_maint_baseline();
                focus.maint(data).await;
                let _ = self.events.send(PoolEvent::Maint { pid: focus_pid });
            }
        }

        // End-of-life recycle, then rolling restart — mutually exclusive per
        // tick, both bounded by the launch concurrency guard.
        if counts.startup + counts.shutdown < cfg.max_concurrent_launches
            && counts.active > 1
            && focus.state() == ProxyState::Active
        {
            let budget = focus.request_budget();
            if budget > 0 && focus.num_requests_served() >= budget {
                tracing::info!(
                    pool = %self.id,
                    pid = focus_pid,
                    served = focus.num_requests_served(),
                    "recycling worker at end of request budget"
                );
                focus.shutdown().await;
                let _ = self.events.send(PoolEvent::Restart { pid: focus_pid });
            } else if focus.take_request_restart() {
                tracing::info!(pool = %self.id, pid = focus_pid, "rolling restart");
                focus.shutdown().await;
                let _ = self.events.send(PoolEvent::Restart { pid: focus_pid });
            }
        }

        // Pool-wide auto-scaling: at most one action per tick. The busy
        // count plus headroom keeps one idle worker in reserve at steady
        // state (the min_children - 1 clamp re-fills after restarts).
        let num_busy = inner
            .proxies
            .values()
            .filter(|p| {
                p.state() == ProxyState::Active
                    && p.num_active_requests() >= cfg.child_busy_factor
            })
            .count();
        let mut num_busy_adj =
            ((num_busy as f64) * (1.0 + cfg.child_headroom_pct as f64 / 100.0)).floor() as usize;
        num_busy_adj = num_busy_adj.max(cfg.min_children.saturating_sub(1));

        let num_children = counts.startup + counts.active;
        let total = inner.proxies.len();
        let total_sans_shut = total - counts.shutdown;

        if num_busy_adj >= num_children
            && counts.startup < cfg.max_concurrent_launches
            && total_sans_shut < cfg.max_children
        {
            match self.launch_worker_locked(&mut inner).await {
                Ok((proxy, _ready)) => {
                    tracing::info!(pool = %self.id, pid = proxy.pid(), "auto-scale up");
                    let _ = self.events.send(PoolEvent::Autoscale {
                        action: ScaleAction::Add,
                        pid: proxy.pid(),
                    });
                }
                Err(e) => {
                    tracing::error!(pool = %self.id, "auto-scale up failed: {e}");
                }
            }
        } else if num_busy_adj < counts.active.saturating_sub(1)
            && counts.active > 1
            && total > cfg.min_children
        {
            let victim = inner
                .proxies
                .values()
                .find(|p| p.state() == ProxyState::Active && p.num_active_requests() == 0)
                .cloned();
            if let Some(victim) = victim {
                tracing::info!(pool = %self.id, pid = victim.pid(), "auto-scale down");
                victim.shutdown().await;
                let _ = self.events.send(PoolEvent::Autoscale {
                    action: ScaleAction::Remove,
                    pid: victim.pid(),
                });
            }
        }
    }

    // ── Broadcast operations ─────────────────────────────────────────────────

    /// Write a `message` frame to every worker not in shutdown, exactly once
    /// per call.
    pub async fn send_message(&self, data: Value) {
        let proxies: Vec<Arc<WorkerProxy>> = {
            let inner = self.inner.lock().await;
            inner.proxies.values().cloned().collect()
        };
        for proxy in proxies {
            if proxy.state() != ProxyState::Shutdown {
                proxy.send_message(data.clone()).await;
            }
        }
    }

    /// Send an `internal` (debug-channel) frame to one worker.
    pub async fn send_internal(&self, pid: u32, data: Value) -> bool {
        match self.worker(pid).await {
            Some(proxy) => {
                proxy.send_internal(data).await;
                true
            }
            None => false,
        }
    }

    /// Flag every worker for maintenance; ticks realise it one worker at a
    /// time under `max_concurrent_maint`. `data` rides along to the worker's
    /// maint hook.
    pub async fn request_maint(&self, data: Option<Value>) {
        let inner = self.inner.lock().await;
        for proxy in inner.proxies.values() {
            if proxy.state() != ProxyState::Shutdown {
                proxy.set_request_maint(data.clone().unwrap_or(Value::Null));
            }
        }
    }

    /// Flag every worker for a rolling restart; ticks shut them down one at
    /// a time under the launch-concurrency guard, and the auto-scaler spawns
    /// replacements.
    pub async fn request_restart(&self) {
        let inner = self.inner.lock().await;
        for proxy in inner.proxies.values() {
            if proxy.state() != ProxyState::Shutdown {
                proxy.set_request_restart();
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Shut every worker down and wait until the pid map is empty (child
    /// exits observed). Kill timers bound the wait for stuck children.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let proxies: Vec<Arc<WorkerProxy>> = {
            let inner = self.inner.lock().await;
            inner.proxies.values().cloned().collect()
        };
        tracing::info!(pool = %self.id, workers = proxies.len(), "pool shutting down");
        for proxy in proxies {
            proxy.shutdown().await;
        }
        loop {
            if self.inner.lock().await.proxies.is_empty() {
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        tracing::info!(pool = %self.id, "pool drained");
    }
}

fn pick_least_loaded(proxies: &HashMap<u32, Arc<WorkerProxy>>) -> Option<Arc<WorkerProxy>> {
    let mut min = usize::MAX;
    let mut ties: Vec<&Arc<WorkerProxy>> = Vec::new();
    for proxy in proxies.values() {
        if proxy.state() != ProxyState::Active {
            continue;
        }
        let n = proxy.num_active_requests();
        if n < min {
            min = n;
            ties.clear();
            ties.push(proxy);
        } else if n == min {
            ties.push(proxy);
        }
    }
    if ties.is_empty() {
        None
    } else if ties.len() == 1 {
        Some(Arc::clone(ties[0]))
    } else {
        let idx = rand::thread_rng().gen_range(0..ties.len());
        Some(Arc::clone(ties[idx]))
    }
}
