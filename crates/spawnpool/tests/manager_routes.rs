//! Manager-level integration: pool registry lifecycle, URI route binding
//! against a recording registrar, and the tick fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::sleep;

use spawnpool::router::{RouteHandler, RouteId, RouteRegistrar, UriRoute};
use spawnpool::{
    ManagerConfig, MockChildIo, MockTransport, PoolConfig, PoolError, PoolManager, RequestArgs,
};
use spawnpool_worker::{HandlerReply, WorkerHandler, WorkerRequest, WorkerRuntime};

struct EchoHandler;

#[async_trait]
impl WorkerHandler for EchoHandler {
    async fn request(&self, req: WorkerRequest) -> HandlerReply {
        if req.envelope.query.get("mode").map(String::as_str) == Some("sleep") {
            let ms = req
                .envelope
                .query
                .get("ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000u64);
            sleep(Duration::from_millis(ms)).await;
        }
        HandlerReply::Json(json!({"uri": req.envelope.uri}))
    }

    async fn custom(&self, params: serde_json::Value) -> Result<serde_json::Value, String> {
        Ok(json!({"code": 0, "params": params}))
    }
}

fn worker_transport() -> Arc<MockTransport> {
    Arc::new(MockTransport::new(|io: MockChildIo| async move {
        let runtime = WorkerRuntime::new(EchoHandler);
        let _ = runtime.run(io.reader, io.writer).await;
    }))
}

/// Registrar test double: records registered routes and unregistrations.
#[derive(Default)]
struct RecordingRegistrar {
    next_id: AtomicU64,
    routes: StdMutex<HashMap<RouteId, (UriRoute, RouteHandler)>>,
    unregistered: StdMutex<Vec<RouteId>>,
}

impl RouteRegistrar for RecordingRegistrar {
    fn register(&self, route: UriRoute, handler: RouteHandler) -> RouteId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.routes
            .lock()
            .unwrap()
            .insert(id, (route, handler));
        id
    }

    fn unregister(&self, id: RouteId) {
        self.routes.lock().unwrap().remove(&id);
        self.unregistered.lock().unwrap().push(id);
    }
}

fn pool_config() -> PoolConfig {
    PoolConfig {
        uri_match: Some("/thumbs/".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_and_remove_pool() {
    let manager = PoolManager::with_transport(ManagerConfig::default(), worker_transport());

    let pool = manager.create_pool("thumbs", PoolConfig::default()).await.unwrap();
    assert_eq!(pool.workers().await.len(), 1);
    assert!(manager.get_pool("thumbs").await.is_some());

    manager.remove_pool("thumbs").await.unwrap();
    assert!(manager.get_pool("thumbs").await.is_none());
    assert!(pool.workers().await.is_empty(), "no child survives remove_pool");
}

#[tokio::test]
async fn test_duplicate_pool_id_rejected() {
    let manager = PoolManager::with_transport(ManagerConfig::default(), worker_transport());
    manager.create_pool("p", PoolConfig::default()).await.unwrap();
    assert!(matches!(
        manager.create_pool("p", PoolConfig::default()).await,
        Err(PoolError::PoolExists(_))
    ));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_route_registered_and_dispatchable() {
    let registrar = Arc::new(RecordingRegistrar::default());
    let manager = PoolManager::with_transport(ManagerConfig::default(), worker_transport())
        .with_registrar(registrar.clone());

    manager.create_pool("thumbs", pool_config()).await.unwrap();

    let (route, handler) = {
        let routes = registrar.routes.lock().unwrap();
        assert_eq!(routes.len(), 1);
        let (route, handler) = routes.values().next().unwrap();
        (route.clone(), Arc::clone(handler))
    };
    assert!(route.matches("/thumbs/123.png"));
    assert!(!route.matches("/video/123"));

    let parts = handler(RequestArgs::new("GET", "/thumbs/123.png")).await;
    assert_eq!(parts.code(), 200);
    assert!(parts.body.as_text().unwrap().contains("/thumbs/123.png"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_remove_pool_deregisters_route() {
    let registrar = Arc::new(RecordingRegistrar::default());
    let manager = PoolManager::with_transport(ManagerConfig::default(), worker_transport())
        .with_registrar(registrar.clone());

    manager.create_pool("thumbs", pool_config()).await.unwrap();
    manager.remove_pool("thumbs").await.unwrap();

    assert!(registrar.routes.lock().unwrap().is_empty());
    assert_eq!(registrar.unregistered.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_manager_startup_skips_disabled_pools() {
    let config = ManagerConfig {
        pools: [
            ("on".to_string(), PoolConfig::default()),
            (
                "off".to_string(),
                PoolConfig {
                    enabled: false,
                    ..Default::default()
                },
            ),
        ]
        .into(),
        ..Default::default()
    };
    let manager = PoolManager::with_transport(config, worker_transport());
    manager.startup().await.unwrap();

    assert!(manager.get_pool("on").await.is_some());
    assert!(manager.get_pool("off").await.is_none());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_ticker_drives_autoscale() {
    // One worker under sustained load; the 1 Hz ticker must add the second
    // worker without manual tick() calls.
    let config = ManagerConfig {
        pools: [(
            "grow".to_string(),
            PoolConfig {
                min_children: 1,
                max_children: 2,
                ..Default::default()
            },
        )]
        .into(),
        ..Default::default()
    };
    let manager = PoolManager::with_transport(config, worker_transport());
    manager.startup().await.unwrap();
    let pool = manager.get_pool("grow").await.unwrap();

    // Keep the lone worker busy long enough to span a tick.
    let busy_pool = Arc::clone(&pool);
    let busy = tokio::spawn(async move {
        let mut args = RequestArgs::new("GET", "/slow");
        args.query.insert("mode".into(), "sleep".into());
        busy_pool.dispatch(args).await
    });

    let mut grew = false;
    for _ in 0..300 {
        if pool.workers().await.len() == 2 {
            grew = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(grew, "ticker did not auto-scale the pool");

    let _ = busy.await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_emergency_shutdown_with_no_real_children_is_noop() {
    // Mock children have no OS process; the sweep must simply find nothing.
    let manager = PoolManager::with_transport(ManagerConfig::default(), worker_transport());
    manager.create_pool("p", PoolConfig::default()).await.unwrap();
    manager.emergency_shutdown();
    // The pool is untouched by the (empty) kill sweep.
    let pool = manager.get_pool("p").await.unwrap();
    let (value, _) = pool.dispatch_custom(json!({"ping": 1})).await.unwrap();
    assert_eq!(value["code"], 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_unique_ids_never_collide() {
    let manager = PoolManager::with_transport(ManagerConfig::default(), worker_transport());
    let mut ids = std::collections::HashSet::new();
    for _ in 0..100 {
        ids.insert(manager.get_unique_id("r"));
    }
    assert_eq!(ids.len(), 100);
}
