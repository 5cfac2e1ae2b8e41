//! The two halves of descriptor-passing operation.
//!
//! `ProcessManager` is the front end: it owns the public listener and the worker processes,
//! and hands each accepted connection's descriptor to a worker. `OnDemandServer` runs inside
//! a worker: it receives those descriptors and serves them like any other connection.

use super::*;
use super::children::{AppConfig, ChildManager};
use super::error::Result;
use super::hi::connection::ConnectionId;
use super::server::{is_fatal_accept_error, pause_after_accept_error};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Worker-side server fed by a descriptor channel.
#[derive(Clone)]
pub struct OnDemandServer {
    server: FastcgiServer,
}

impl OnDemandServer {
    /// `channel` is the inherited Unix socket descriptors arrive on (the worker's stdin, when
    /// spawned by `ProcessManager`). It is validated when the server starts.
    pub fn new<R: FastcgiResponder>(channel: RawFd, config: ServerConfig, responder: R)
        -> OnDemandServer
    {
        OnDemandServer {
            server: FastcgiServer::new(ListenAddress::Channel(channel), config, responder),
        }
    }

    /// Start receiving connections in the background.
    pub async fn start(&self) -> Result<bool> {
        self.server.start(true, 0).await
    }

    pub async fn stop(&self) {
        self.server.stop().await
    }

    /// Serve a connection that arrived some other way.
    pub fn on_accept(&self, stream: FastcgiStream) -> Option<ConnectionId> {
        self.server.on_accept(stream)
    }

    pub fn set_responder<R: FastcgiResponder>(&self, responder: R) {
        self.server.set_responder(responder)
    }

    /// Resolves once the front end has closed the channel (or `stop` was called).
    pub async fn closed(&self) {
        self.server.closed().await
    }

    pub fn server(&self) -> &FastcgiServer {
        &self.server
    }
}

/// Front end: accepts connections and distributes them among worker processes.
pub struct ProcessManager {
    address: ListenAddress,
    children: Arc<ChildManager>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ProcessManager {
    pub fn new(address: ListenAddress) -> ProcessManager {
        ProcessManager {
            address,
            children: Arc::new(ChildManager::new()),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Spawn one worker per application. Returns how many started.
    pub fn start_children(&self, apps: &[AppConfig]) -> usize {
        let started = self.children.start_children(apps);
        info!("started {} of {} workers", started, apps.len());
        started
    }

    pub async fn kill_children(&self) {
        self.children.kill_children().await
    }

    pub fn children(&self) -> &ChildManager {
        &self.children
    }

    /// Bind and start handing out connections in the background.
    pub async fn start(&self, backlog: u32) -> Result<()> {
        let listener = FastcgiListener::bind(&self.address, backlog)?;
        *lock(&self.local_addr) = listener.local_addr();

        let children = Arc::clone(&self.children);
        let shutdown = self.shutdown.clone();
        let address = self.address.clone();
        let task = tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = listener.accept() => match result {
                        Ok(stream) => stream,
                        Err(ref e) if is_fatal_accept_error(e) => {
                            error!("accept on {} failed: {}; no longer accepting", address, e);
                            break;
                        },
                        Err(e) => {
                            warn!("accept on {} failed: {}", address, e);
                            if !pause_after_accept_error(&shutdown).await {
                                break;
                            }
                            continue;
                        },
                    },
                };
                if let Err(e) = children.dispatch(&stream).await {
                    warn!("dropping connection: {}", e);
                }
                // Only our copy of the descriptor is closed; the worker's stays open.
                drop(stream);
            }
            debug!("process manager on {} no longer accepting", address);
        });
        *lock(&self.task) = Some(task);
        Ok(())
    }

    /// Stop accepting, then kill every worker.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("process manager task failed: {}", e);
            }
        }
        self.kill_children().await;
        info!("process manager on {} stopped", self.address);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }
}
