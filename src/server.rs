//! The generic server: owns the listener, runs the accept loop, and keeps the registry of live
//! connections.

use super::*;
use super::error::{Error, Result};
use super::hi::connection::ConnectionId;

use nix::errno::Errno;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

/// Pause after a transient accept failure (e.g. out of descriptors) before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Most connections served at once. Further clients wait in the listen backlog.
    pub max_connections: usize,
    /// Most requests in flight on one connection, when multiplexing.
    pub max_requests: usize,
    /// Allow more than one request per connection at a time.
    pub multiplex: bool,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            max_connections: 1024,
            max_requests: 1024,
            multiplex: false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Errors that mean the listener itself is unusable, as opposed to one failed accept.
pub(crate) fn is_fatal_accept_error(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::BrokenPipe {
        return true;
    }
    match e.raw_os_error() {
        Some(code) => [Errno::EBADF, Errno::EINVAL, Errno::ENOTSOCK]
            .iter()
            .any(|errno| *errno as i32 == code),
        None => false,
    }
}

/// Wait out `ACCEPT_RETRY_DELAY` after a transient accept failure. Returns false, early, if
/// `shutdown` fires first.
pub(crate) async fn pause_after_accept_error(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

struct TrackedConnection {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    // Holds one of the server's connection slots until this entry is dropped.
    _slot: OwnedSemaphorePermit,
}

struct Inner {
    address: ListenAddress,
    config: Arc<ServerConfig>,
    responder: RwLock<Arc<dyn FastcgiResponder>>,
    connections: Mutex<HashMap<ConnectionId, TrackedConnection>>,
    slots: Arc<Semaphore>,
    next_id: AtomicU64,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    accept_finished: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    // Tasks of connections ended from outside, still shutting their sockets down.
    closing: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// A FastCGI server on one listen address.
///
/// Cloning gives another handle to the same server. A server is started at most once; after
/// `stop` it cannot be restarted.
#[derive(Clone)]
pub struct FastcgiServer {
    inner: Arc<Inner>,
}

impl FastcgiServer {
    pub fn new<R: FastcgiResponder>(address: ListenAddress, config: ServerConfig, responder: R)
        -> FastcgiServer
    {
        let slots = Arc::new(Semaphore::new(config.max_connections.min(Semaphore::MAX_PERMITS)));
        FastcgiServer {
            inner: Arc::new(Inner {
                address,
                config: Arc::new(config),
                responder: RwLock::new(Arc::new(responder)),
                connections: Mutex::new(HashMap::new()),
                slots,
                next_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                accept_finished: CancellationToken::new(),
                accept_task: Mutex::new(None),
                closing: Mutex::new(Vec::new()),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Bind, listen with `backlog`, and begin accepting.
    ///
    /// With `background` set this returns as soon as the listener is up; otherwise it returns
    /// once the accept loop has ended. Returns `Ok(false)` if the bind was refused for lack of
    /// permission; any other failure is an error.
    pub async fn start(&self, background: bool, backlog: u32) -> Result<bool> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let listener = match FastcgiListener::bind(&self.inner.address, backlog) {
            Ok(listener) => listener,
            Err(ref e) if e.is_permission_denied() => {
                error!("cannot listen on {}: {}", self.inner.address, e);
                self.inner.accept_finished.cancel();
                return Ok(false);
            },
            Err(e) => {
                self.inner.accept_finished.cancel();
                return Err(e);
            },
        };
        *lock(&self.inner.local_addr) = listener.local_addr();

        {
            // `stop` sets the flag before taking this lock, so it either finds the task here or
            // we see the flag.
            let mut accept_task = lock(&self.inner.accept_task);
            if self.inner.stopped.load(Ordering::SeqCst) {
                self.inner.accept_finished.cancel();
                return Ok(false);
            }
            let server = self.clone();
            *accept_task = Some(tokio::spawn(async move { server.accept_loop(listener).await }));
        }

        if !background {
            self.closed().await;
        }
        Ok(true)
    }

    async fn accept_loop(self, listener: FastcgiListener) {
        let inner = &self.inner;
        loop {
            let slot = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                slot = Arc::clone(&inner.slots).acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            let stream = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                result = listener.accept() => match result {
                    Ok(stream) => stream,
                    Err(ref e) if is_fatal_accept_error(e) => {
                        error!("accept on {} failed: {}; no longer accepting", inner.address, e);
                        break;
                    },
                    Err(e) => {
                        warn!("accept on {} failed: {}", inner.address, e);
                        drop(slot);
                        if !pause_after_accept_error(&inner.shutdown).await {
                            break;
                        }
                        continue;
                    },
                },
            };

            if self.register(stream, slot).is_none() {
                break;
            }
        }

        drop(listener);
        inner.accept_finished.cancel();
        debug!("accept loop on {} finished", inner.address);
    }

    /// Register an accepted stream and spawn its connection task. Returns `None`, dropping the
    /// stream, if the server is stopping.
    fn register(&self, stream: FastcgiStream, slot: OwnedSemaphorePermit)
        -> Option<ConnectionId>
    {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = inner.shutdown.child_token();
        let responder = Arc::clone(&*inner.responder.read().unwrap_or_else(PoisonError::into_inner));
        let connection = FastcgiConnection::new(id, stream, Arc::clone(&inner.config), responder);

        let mut connections = lock(&inner.connections);
        // Checked under the lock: `stop` sets the flag before draining the registry, so either
        // it sees this entry or this sees the flag.
        if inner.stopped.load(Ordering::SeqCst) {
            debug!("dropping connection accepted during shutdown");
            return None;
        }
        connections.insert(id, TrackedConnection {
            cancel: cancel.clone(),
            task: None,
            _slot: slot,
        });

        let server = self.clone();
        let task = tokio::spawn(async move {
            connection.run(cancel).await;
            server.unregister(id);
        });
        if let Some(tracked) = connections.get_mut(&id) {
            tracked.task = Some(task);
        }
        debug!("connection {} accepted on {}; {} open", id, inner.address, connections.len());
        Some(id)
    }

    /// Serve a stream obtained some other way than from this server's listener. Returns
    /// `None`, dropping the stream, if the server is stopped or has no free connection slot.
    pub fn on_accept(&self, stream: FastcgiStream) -> Option<ConnectionId> {
        match Arc::clone(&self.inner.slots).try_acquire_owned() {
            Ok(slot) => self.register(stream, slot),
            Err(_) => {
                warn!("no free connection slot on {}; dropping connection", self.inner.address);
                None
            },
        }
    }

    /// Unregister a connection, closing it if it is still running, and free its slot for the
    /// accept loop. Returns false if no such connection was registered.
    pub fn end_connection(&self, id: ConnectionId) -> bool {
        let removed = lock(&self.inner.connections).remove(&id);
        match removed {
            Some(tracked) => {
                tracked.cancel.cancel();
                if let Some(task) = tracked.task {
                    let mut closing = lock(&self.inner.closing);
                    closing.retain(|task| !task.is_finished());
                    closing.push(task);
                }
                debug!("connection {} ended; {} open", id, self.connection_count());
                true
            },
            None => false,
        }
    }

    /// Called by a connection's own task once it has closed its socket.
    fn unregister(&self, id: ConnectionId) {
        if lock(&self.inner.connections).remove(&id).is_some() {
            debug!("connection {} finished; {} open", id, self.connection_count());
        }
    }

    /// Stop accepting, close the listener, close every connection, and wait for all of their
    /// tasks to finish. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping server on {}", self.inner.address);
        self.inner.shutdown.cancel();

        let accept_task = lock(&self.inner.accept_task).take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                error!("accept task on {} failed: {}", self.inner.address, e);
            }
        }
        // Never started, or the bind failed: nothing else will mark it.
        self.inner.accept_finished.cancel();

        let tracked: Vec<(ConnectionId, TrackedConnection)> =
            lock(&self.inner.connections).drain().collect();
        for (_, connection) in &tracked {
            connection.cancel.cancel();
        }
        for (id, connection) in tracked {
            if let Some(task) = connection.task {
                if let Err(e) = task.await {
                    error!("connection {} task failed: {}", id, e);
                }
            }
        }
        let closing: Vec<JoinHandle<()>> = lock(&self.inner.closing).drain(..).collect();
        for task in closing {
            if let Err(e) = task.await {
                error!("connection task failed while closing: {}", e);
            }
        }
        info!("server on {} stopped", self.inner.address);
    }

    /// Replace the responder used for connections accepted from now on.
    pub fn set_responder<R: FastcgiResponder>(&self, responder: R) {
        *self.inner.responder.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(responder);
    }

    /// Wait until the accept loop has ended, whether through `stop` or because the listener
    /// failed.
    pub async fn closed(&self) {
        self.inner.accept_finished.cancelled().await
    }

    pub fn max_connections(&self) -> usize {
        self.inner.config.max_connections
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    /// True while there is room for another connection and the server isn't stopping.
    pub fn can_accept(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
            && self.connection_count() < self.inner.config.max_connections
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.inner.accept_task).is_some() && !self.inner.accept_finished.is_cancelled()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn address(&self) -> &ListenAddress {
        &self.inner.address
    }

    /// The bound TCP address, once started. Useful after binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }
}
