//! The client-facing server: shared context, client table, and the
//! listener/accept loop.
//!
//! There is no process-global state; everything the listener, sessions,
//! fan-out, log sink, and reaper share travels in one `ServerContext`.
//! Session outbound queues are mpsc senders, so enqueuing a response never
//! re-enters the client-table lock; the lock is only held to look a
//! session up or to mutate the table itself.
//!
//! Lock order: a thread may take the client-table lock while holding a root
//! lock (the fan-out does), never the other way around.

pub mod commands;
pub mod fanout;
pub mod log_sink;
pub mod reaper;
pub mod session;

#[cfg(test)]
mod server_tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::UnixListener;
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc};

use crate::daemon_log::daemon_log;
use crate::root::{Root, RootRegistry};
use self::log_sink::{server_log, LogLevel};

/// The client table's view of one connected session.
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Value>,
    log_level: LogLevel,
}

/// Shared server state, passed explicitly to every component.
pub struct ServerContext {
    clients: Mutex<HashMap<u64, ClientHandle>>,
    next_client_id: AtomicU64,
    pub roots: RootRegistry,
    /// Children spawned by triggers, awaiting the reaper.
    pub children: Mutex<Vec<Child>>,
    pub sockname: PathBuf,
    pub state_file: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
}

impl ServerContext {
    pub fn new(sockname: PathBuf, state_file: PathBuf) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            roots: RootRegistry::default(),
            children: Mutex::new(Vec::new()),
            sockname,
            state_file,
            shutdown_tx,
        })
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Begins orderly shutdown: the accept loop, all sessions, and the
    /// reaper observe the broadcast and wind down.
    pub fn initiate_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Registers a new session and returns its id and outbound queue.
    pub fn register_client(&self) -> (u64, mpsc::UnboundedReceiver<Value>) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.lock().insert(
            id,
            ClientHandle { tx, log_level: LogLevel::Off },
        );
        (id, rx)
    }

    /// Deregisters a session: drops its queue and cancels every
    /// subscription it owns. Runs on every session exit path.
    pub fn remove_client(&self, id: u64) {
        self.clients.lock().remove(&id);
        for root in self.roots.all() {
            root.lock().subscriptions.retain(|s| s.client_id != id);
        }
    }

    /// Enqueues a response onto a session's outbound queue. Returns false
    /// if the session is gone; the caller drops the response silently.
    pub fn enqueue(&self, id: u64, value: Value) -> bool {
        match self.clients.lock().get(&id) {
            Some(handle) => handle.tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn set_log_level(&self, id: u64, level: LogLevel) {
        if let Some(handle) = self.clients.lock().get_mut(&id) {
            handle.log_level = level;
        }
    }

    /// Senders of every session whose filter admits `level`.
    pub fn log_recipients(&self, level: LogLevel) -> Vec<mpsc::UnboundedSender<Value>> {
        self.clients
            .lock()
            .values()
            .filter(|h| h.log_level != LogLevel::Off && h.log_level >= level)
            .map(|h| h.tx.clone())
            .collect()
    }

    /// Resolves a root name, optionally creating the watch.
    ///
    /// Creation canonicalizes the path, scans the tree so queries see it
    /// immediately, starts the filesystem watcher, and persists the watch
    /// list. The error string is surfaced to the client inside an
    /// `unable to resolve root` message.
    pub async fn resolve_root(self: &Arc<Self>, name: &str, create: bool) -> Result<Arc<Root>, String> {
        let canonical = std::fs::canonicalize(name).map_err(|e| format!("{}: {}", name, e))?;
        if let Some(root) = self.roots.get(&canonical) {
            return Ok(root);
        }
        if !create {
            return Err(format!("directory {} is not watched", canonical.display()));
        }
        if !canonical.is_dir() {
            return Err(format!("{} is not a directory", canonical.display()));
        }

        let root = Root::new(canonical);
        let scan_root = root.clone();
        let scanned = tokio::task::spawn_blocking(move || crate::watcher::initial_scan(&scan_root))
            .await
            .map_err(|e| format!("scan of {} failed: {}", name, e))?;
        crate::watcher::start(self.clone(), root.clone())
            .map_err(|e| format!("unable to watch {}: {}", root.path.display(), e))?;
        self.roots.insert(root.clone());

        if let Err(e) = crate::state::save(self) {
            daemon_log("state", &format!("failed to persist state: {:#}", e));
        }
        server_log(
            self,
            LogLevel::Info,
            &format!("now watching {} ({} files)", root.path.display(), scanned),
        );
        Ok(root)
    }

    /// Releases every watched root. Part of shutdown and `watch-del`-all.
    pub fn free_all_roots(&self) {
        for root in self.roots.drain() {
            root.stop_watcher();
        }
    }
}

/// Binds the listening socket and runs the accept loop until shutdown.
///
/// Any prior socket file is unlinked before binding; a stale file from a
/// crashed instance must not block startup.
pub async fn run(ctx: Arc<ServerContext>) -> Result<()> {
    if let Some(parent) = ctx.sockname.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    if ctx.sockname.exists() {
        std::fs::remove_file(&ctx.sockname)
            .with_context(|| format!("Failed to remove stale socket {}", ctx.sockname.display()))?;
    }

    let listener = UnixListener::bind(&ctx.sockname)
        .with_context(|| format!("Failed to bind {}", ctx.sockname.display()))?;
    daemon_log("server", &format!("listening on {}", ctx.sockname.display()));

    let mut shutdown_rx = ctx.subscribe_shutdown();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let (id, rx) = ctx.register_client();
                    daemon_log("server", &format!("client {} connected", id));
                    let conn_ctx = ctx.clone();
                    tokio::spawn(async move {
                        session::run_session(conn_ctx, stream, id, rx).await;
                    });
                }
                Err(e) => {
                    daemon_log("server", &format!("accept failed: {}", e));
                }
            },
            _ = shutdown_rx.recv() => break,
        }
    }

    // Orderly teardown: stop watching, persist, remove the socket file.
    ctx.free_all_roots();
    if let Err(e) = crate::state::save(&ctx) {
        daemon_log("server", &format!("failed to persist state on shutdown: {:#}", e));
    }
    let _ = std::fs::remove_file(&ctx.sockname);
    daemon_log("server", "shutdown complete");
    Ok(())
}
