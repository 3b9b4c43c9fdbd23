//! Watched roots and the root registry (the resolver).
//!
//! A root is an absolute directory plus everything the daemon knows about
//! it: the logical clock and cursor table, the file table, the standing
//! subscriptions, and the trigger definitions. All of that mutable state
//! sits behind one mutex per root.
//!
//! Lock order: a thread holding a root lock may take the client-table lock
//! to enqueue a response, never the reverse.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::RecommendedWatcher;
use notify_debouncer_mini::Debouncer;
use parking_lot::{Mutex, MutexGuard};

use crate::clock::{RootClock, Ticks};
use crate::files::FileRecord;
use crate::query::Query;
use crate::trigger::TriggerDef;

/// A standing subscription registered against a root.
#[derive(Debug)]
pub struct Subscription {
    pub client_id: u64,
    pub name: String,
    pub query: Query,
    /// Tick up to which this subscription has already been notified.
    pub last_ticks: Ticks,
}

/// The lock-protected state of one watched root.
#[derive(Debug, Default)]
pub struct RootState {
    pub clock: RootClock,
    pub files: HashMap<String, FileRecord>,
    pub subscriptions: Vec<Subscription>,
    pub triggers: BTreeMap<String, TriggerDef>,
}

type RootWatcher = Debouncer<RecommendedWatcher>;

/// One watched directory tree.
pub struct Root {
    pub path: PathBuf,
    state: Mutex<RootState>,
    /// The live debouncer; dropping it stops event delivery and closes the
    /// channel its processing task reads from.
    watcher: Mutex<Option<RootWatcher>>,
}

impl Root {
    pub fn new(path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            path,
            state: Mutex::new(RootState::default()),
            watcher: Mutex::new(None),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, RootState> {
        self.state.lock()
    }

    pub fn set_watcher(&self, watcher: RootWatcher) {
        *self.watcher.lock() = Some(watcher);
    }

    /// Stops filesystem event delivery for this root.
    pub fn stop_watcher(&self) {
        self.watcher.lock().take();
    }
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root").field("path", &self.path).finish()
    }
}

/// The registry of live roots, keyed by canonical path.
#[derive(Debug, Default)]
pub struct RootRegistry {
    roots: Mutex<HashMap<PathBuf, Arc<Root>>>,
}

impl RootRegistry {
    pub fn get(&self, path: &Path) -> Option<Arc<Root>> {
        self.roots.lock().get(path).cloned()
    }

    pub fn insert(&self, root: Arc<Root>) {
        self.roots.lock().insert(root.path.clone(), root);
    }

    pub fn remove(&self, path: &Path) -> Option<Arc<Root>> {
        self.roots.lock().remove(path)
    }

    pub fn all(&self) -> Vec<Arc<Root>> {
        self.roots.lock().values().cloned().collect()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.roots.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Empties the registry, returning the removed roots so the caller can
    /// stop their watchers.
    pub fn drain(&self) -> Vec<Arc<Root>> {
        self.roots.lock().drain().map(|(_, r)| r).collect()
    }

    /// Canonicalizes `name` and requires it to already be watched. This is
    /// the resolution path for client-mode sessions, which may not create
    /// new roots.
    pub fn resolve_existing(&self, name: &str) -> Result<Arc<Root>, String> {
        let canonical =
            std::fs::canonicalize(name).map_err(|e| format!("{}: {}", name, e))?;
        self.get(&canonical)
            .ok_or_else(|| format!("directory {} is not watched", canonical.display()))
    }
}
