//! Transport abstraction for child workers.
//!
//! [`ChildTransport`] is the trait seam between [`crate::proxy::WorkerProxy`]
//! and the mechanism that produces a child. Production code uses
//! [`ProcessTransport`] (spawns the pool's configured executable with piped
//! stdio); [`MockTransport`] runs an in-memory child task over duplex pipes
//! for integration tests, with a synthetic pid and no OS process.
//!
//! The trait only covers I/O creation. The proxy keeps ownership of the
//! reader loop and exit handling because they are coupled with its pending
//! table and state machine.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::config::PoolConfig;
use crate::error::PoolError;

/// Raw I/O handles produced by a successful [`ChildTransport::spawn`] call.
///
/// `stdin`/`stdout` are boxed trait objects so non-process transports can
/// provide in-memory implementations.
pub struct SpawnedChild {
    /// Child pid: the OS pid for real processes, a synthetic id for mocks.
    pub pid: u32,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Text log channel; `None` for transports without one.
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// The OS process handle, retained for force-kill. `None` for mocks,
    /// which terminate when their streams close.
    pub process: Arc<Mutex<Option<Child>>>,
    /// Whether `pid` names a real OS process (and belongs in the
    /// [`PidRegistry`] for emergency kills).
    pub is_process: bool,
}

impl std::fmt::Debug for SpawnedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedChild")
            .field("pid", &self.pid)
            .field("is_process", &self.is_process)
            .finish_non_exhaustive()
    }
}

/// Abstracts how a pool obtains child workers.
#[async_trait]
pub trait ChildTransport: Send + Sync + std::fmt::Debug {
    /// Start one child for the given pool config and return its I/O handles.
    ///
    /// # Errors
    ///
    /// [`PoolError::SpawnFailed`] when the child cannot be started.
    async fn spawn(&self, config: &PoolConfig) -> Result<SpawnedChild, PoolError>;
}

/// Production transport: spawns the pool's configured executable with the
/// standard three pipes, the parent environment merged with `exec_env`, and
/// an optional working directory.
#[derive(Debug, Default)]
pub struct ProcessTransport;

#[async_trait]
impl ChildTransport for ProcessTransport {
    async fn spawn(&self, config: &PoolConfig) -> Result<SpawnedChild, PoolError> {
        use tokio::process::Command;

        if config.exec_cmd.is_empty() {
            return Err(PoolError::SpawnFailed("exec_cmd is empty".into()));
        }

        let mut cmd = Command::new(&config.exec_cmd);
        cmd.args(&config.exec_args);
        cmd.envs(&config.exec_env);
        if let Some(cwd) = &config.exec_cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| PoolError::SpawnFailed(format!("{}: {e}", config.exec_cmd)))?;

        let pid = child
            .id()
            .ok_or_else(|| PoolError::SpawnFailed("child exited before it was tracked".into()))?;
        let stdin = child.stdin.take().expect("child stdin must be piped");
        let stdout = child.stdout.take().expect("child stdout must be piped");
        let stderr = child.stderr.take().expect("child stderr must be piped");

        Ok(SpawnedChild {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Some(Box::new(stderr)),
            process: Arc::new(Mutex::new(Some(child))),
            is_process: true,
        })
    }
}

/// I/O handles given to a mock child task: its end of the duplex pipes.
pub struct MockChildIo {
    pub reader: ReadHalf<DuplexStream>,
    pub writer: WriteHalf<DuplexStream>,
}

type MockChildFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type MockChildFactory = Arc<dyn Fn(MockChildIo) -> MockChildFuture + Send + Sync>;

/// Synthetic pid space for mock children, far above real pid ranges used in
/// practice so test assertions cannot collide with OS pids.
static NEXT_MOCK_PID: AtomicU32 = AtomicU32::new(0x0090_0000);

/// In-memory test transport: each `spawn` runs the factory's child task over
/// duplex pipes instead of forking a process.
///
/// There is no process to kill; a mock child terminates when the proxy
/// closes its outbound stream (the child sees EOF and drains), which is the
/// same path a real worker takes on `shutdown`.
pub struct MockTransport {
    factory: MockChildFactory,
    /// Duplex buffer size per direction.
    buffer: usize,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    /// Create a transport whose children run `factory`'s future.
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn(MockChildIo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            factory: Arc::new(move |io| Box::pin(factory(io))),
            buffer: 256 * 1024,
        }
    }
}

#[async_trait]
impl ChildTransport for MockTransport {
    async fn spawn(&self, _config: &PoolConfig) -> Result<SpawnedChild, PoolError> {
        let (parent_io, child_io) = tokio::io::duplex(self.buffer);
        let (parent_read, parent_write) = tokio::io::split(parent_io);
        let (child_read, child_write) = tokio::io::split(child_io);

        let pid = NEXT_MOCK_PID.fetch_add(1, Ordering::Relaxed);
        tokio::spawn((self.factory)(MockChildIo {
            reader: child_read,
            writer: child_write,
        }));

        Ok(SpawnedChild {
            pid,
            stdin: Box::new(parent_write),
            stdout: Box::new(parent_read),
            stderr: None,
            process: Arc::new(Mutex::new(None)),
            is_process: false,
        })
    }
}

/// Registry of live child OS pids, shared across pools for the manager's
/// emergency shutdown (which runs synchronously from a panic hook and cannot
/// take async locks).
#[derive(Debug, Clone, Default)]
pub struct PidRegistry {
    inner: Arc<StdMutex<HashSet<u32>>>,
}

impl PidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, pid: u32) {
        self.inner.lock().expect("pid registry poisoned").insert(pid);
    }

    pub(crate) fn remove(&self, pid: u32) {
        self.inner.lock().expect("pid registry poisoned").remove(&pid);
    }

    /// Snapshot of live child pids.
    pub fn snapshot(&self) -> Vec<u32> {
        self.inner
            .lock()
            .expect("pid registry poisoned")
            .iter()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_mock_transport_assigns_distinct_pids() {
        let transport = MockTransport::new(|_io| async {});
        let config = PoolConfig::default();
        let a = transport.spawn(&config).await.unwrap();
        let b = transport.spawn(&config).await.unwrap();
        assert_ne!(a.pid, b.pid);
        assert!(!a.is_process);
    }

    #[tokio::test]
    async fn test_mock_child_sees_parent_writes() {
        let transport = MockTransport::new(|mut io: MockChildIo| async move {
            let mut buf = [0u8; 4];
            io.reader.read_exact(&mut buf).await.unwrap();
            io.writer.write_all(&buf).await.unwrap();
        });
        let mut spawned = transport.spawn(&PoolConfig::default()).await.unwrap();

        spawned.stdin.write_all(b"ping").await.unwrap();
        spawned.stdin.flush().await.unwrap();
        let mut buf = [0u8; 4];
        spawned.stdout.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_process_transport_rejects_empty_cmd() {
        let err = ProcessTransport
            .spawn(&PoolConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::SpawnFailed(_)));
    }

    #[test]
    fn test_pid_registry_roundtrip() {
        let registry = PidRegistry::new();
        registry.insert(101);
        registry.insert(202);
        registry.remove(101);
        assert_eq!(registry.snapshot(), vec![202]);
    }
}
