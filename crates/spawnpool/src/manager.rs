//! The pool manager: registry of pools, the 1 Hz tick driver, process-wide
//! startup/shutdown fan-out, unique-id generation, and emergency kill.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use spawnpool_proto::ServerInfo;

use crate::config::{ManagerConfig, PoolConfig};
use crate::error::PoolError;
use crate::id::IdGenerator;
use crate::pool::WorkerPool;
use crate::router::{RouteId, RouteRegistrar, UriRoute, bind_pool};
use crate::transport::{ChildTransport, PidRegistry, ProcessTransport};

/// Interval of the pool control loop.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Detect the trimmed host view sent to children in the startup frame.
pub fn detect_server_info(config: &ManagerConfig) -> ServerInfo {
    ServerInfo {
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string()),
        ip: config
            .server_ip
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string()),
        uncatch: config.kill_children_on_panic,
    }
}

/// Owns every pool in the process.
pub struct PoolManager {
    config: ManagerConfig,
    transport: Arc<dyn ChildTransport>,
    server: ServerInfo,
    ids: Arc<IdGenerator>,
    registry: PidRegistry,
    pools: Arc<Mutex<HashMap<String, Arc<WorkerPool>>>>,
    registrar: Option<Arc<dyn RouteRegistrar>>,
    routes: Mutex<HashMap<String, RouteId>>,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("pools", &self.config.pools.len())
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    /// Manager over real child processes.
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_transport(config, Arc::new(ProcessTransport))
    }

    /// Manager with a custom transport (tests use the mock).
    pub fn with_transport(config: ManagerConfig, transport: Arc<dyn ChildTransport>) -> Self {
        let server = detect_server_info(&config);
        Self {
            config,
            transport,
            server,
            ids: Arc::new(IdGenerator::new()),
            registry: PidRegistry::new(),
            pools: Arc::new(Mutex::new(HashMap::new())),
            registrar: None,
            routes: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            ticker: Mutex::new(None),
        }
    }

    /// Attach the HTTP collaborator's route registrar. Pools created after
    /// this with a `uri_match` get a route bound to their dispatch.
    pub fn with_registrar(mut self, registrar: Arc<dyn RouteRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Short, ordered, process-unique id.
    pub fn get_unique_id(&self, prefix: &str) -> String {
        self.ids.next(prefix)
    }

    /// Start every enabled configured pool (parallelism bounded by
    /// `startup_threads`), then start the tick driver.
    ///
    /// # Errors
    ///
    /// The first pool that fails to start aborts startup; already-started
    /// pools are shut down.
    pub async fn startup(&self) -> Result<(), PoolError> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            self.config.startup_threads.max(1),
        ));
        let configs: Vec<(String, PoolConfig)> = self
            .config
            .pools
            .iter()
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(id, cfg)| (id.clone(), cfg.clone()))
            .collect();

        let results = futures_util::future::join_all(configs.into_iter().map(|(id, cfg)| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("startup semaphore closed");
                let result = self.create_pool(&id, cfg).await;
                (id, result)
            }
        }))
        .await;

        let mut first_err: Option<PoolError> = None;
        let mut started = Vec::new();
        for (id, result) in results {
            match result {
                Ok(_) => started.push(id),
                Err(e) => {
                    tracing::error!(pool = %id, "pool startup failed: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_err {
            for id in started {
                let _ = self.remove_pool(&id).await;
            }
            return Err(e);
        }

        self.start_ticker().await;
        if self.config.kill_children_on_panic {
            self.install_panic_hook();
        }
        tracing::info!("pool manager started");
        Ok(())
    }

    /// Create, start, and register one pool; binds its URI route when a
    /// registrar is attached and the config names a pattern.
    ///
    /// # Errors
    ///
    /// Invalid config, duplicate id, or pool startup failure.
    pub async fn create_pool(
        &self,
        id: &str,
        config: PoolConfig,
    ) -> Result<Arc<WorkerPool>, PoolError> {
        config.validate()?;
        {
            let pools = self.pools.lock().await;
            if pools.contains_key(id) {
                return Err(PoolError::PoolExists(id.to_string()));
            }
        }

        let pool = WorkerPool::new(
            id,
            config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.ids),
            self.server.clone(),
            self.registry.clone(),
        );
        pool.startup().await?;

        if let (Some(registrar), Some(pattern)) = (&self.registrar, &config.uri_match) {
            let route = UriRoute::new(pattern, config.acl.clone())?;
            let route_id = bind_pool(registrar.as_ref(), route, Arc::clone(&pool));
            self.routes.lock().await.insert(id.to_string(), route_id);
            tracing::info!(pool = %id, pattern = %pattern, "uri route registered");
        }

        self.pools
            .lock()
            .await
            .insert(id.to_string(), Arc::clone(&pool));
        tracing::info!(pool = %id, "pool registered");
        Ok(pool)
    }

    /// Shut one pool down and deregister its URI route.
    ///
    /// # Errors
    ///
    /// [`PoolError::PoolNotFound`] for an unknown id.
    pub async fn remove_pool(&self, id: &str) -> Result<(), PoolError> {
        let pool = self
            .pools
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| PoolError::PoolNotFound(id.to_string()))?;
        if let Some(route_id) = self.routes.lock().await.remove(id) {
            if let Some(registrar) = &self.registrar {
                registrar.unregister(route_id);
            }
        }
        pool.shutdown().await;
        tracing::info!(pool = %id, "pool removed");
        Ok(())
    }

    pub async fn get_pool(&self, id: &str) -> Option<Arc<WorkerPool>> {
        self.pools.lock().await.get(id).cloned()
    }

    /// Fan one tick out to every pool. The ticker calls this every second;
    /// tests drive it directly.
    pub async fn tick(&self) {
        let pools: Vec<Arc<WorkerPool>> = self.pools.lock().await.values().cloned().collect();
        for pool in pools {
            pool.tick().await;
        }
    }

    async fn start_ticker(&self) {
        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() {
            return;
        }
        let pools = Arc::clone(&self.pools);
        let cancel = self.cancel.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let snapshot: Vec<Arc<WorkerPool>> =
                            pools.lock().await.values().cloned().collect();
                        for pool in snapshot {
                            pool.tick().await;
                        }
                    }
                }
            }
        }));
    }

    /// Stop the ticker and shut every pool down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(ticker) = self.ticker.lock().await.take() {
            let _ = ticker.await;
        }
        let pools: Vec<(String, Arc<WorkerPool>)> =
            self.pools.lock().await.drain().collect();
        for (id, pool) in pools {
            tracing::info!(pool = %id, "shutting down");
            pool.shutdown().await;
        }
        tracing::info!("pool manager stopped");
    }

    /// SIGKILL every live child immediately. Synchronous so a panic hook can
    /// call it; skips mock children (they have no OS process).
    pub fn emergency_shutdown(&self) {
        let pids = self.registry.snapshot();
        tracing::error!(children = pids.len(), "emergency shutdown: killing all children");
        for pid in pids {
            kill_pid(pid);
        }
    }

    /// Install a panic hook that kills every child before unwinding.
    pub fn install_panic_hook(&self) {
        let registry = self.registry.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            for pid in registry.snapshot() {
                kill_pid(pid);
            }
            previous(info);
        }));
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    // SAFETY: SIGKILL delivery to a child pid tracked by the registry.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    tracing::warn!(pid, "emergency kill is not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_server_info_defaults() {
        let info = detect_server_info(&ManagerConfig::default());
        assert!(!info.hostname.is_empty());
        assert_eq!(info.ip, "127.0.0.1");
        assert!(!info.uncatch);
    }

    #[test]
    fn test_detect_server_info_overrides() {
        let config = ManagerConfig {
            server_ip: Some("10.0.0.5".into()),
            kill_children_on_panic: true,
            ..Default::default()
        };
        let info = detect_server_info(&config);
        assert_eq!(info.ip, "10.0.0.5");
        assert!(info.uncatch);
    }

    #[tokio::test]
    async fn test_unique_ids_are_unique() {
        let manager = PoolManager::new(ManagerConfig::default());
        let a = manager.get_unique_id("r");
        let b = manager.get_unique_id("r");
        assert_ne!(a, b);
        assert!(a.starts_with('r'));
    }

    #[tokio::test]
    async fn test_get_pool_unknown_is_none() {
        let manager = PoolManager::new(ManagerConfig::default());
        assert!(manager.get_pool("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_unknown_pool_errors() {
        let manager = PoolManager::new(ManagerConfig::default());
        assert!(matches!(
            manager.remove_pool("nope").await,
            Err(PoolError::PoolNotFound(_))
        ));
    }
}
