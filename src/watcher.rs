//! The filesystem event backend.
//!
//! One debounced watcher per root. Raw events are batched by the debouncer
//! (100 ms window); each settled batch advances the root clock by exactly
//! one tick, restats the changed paths, updates the file table, and then
//! runs subscription fan-out and trigger matching under the root lock.
//! Trigger commands are spawned after the lock is released.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEvent, DebouncedEventKind};
use walkdir::WalkDir;

use crate::daemon_log::daemon_log;
use crate::files::FileRecord;
use crate::root::Root;
use crate::server::{fanout, ServerContext};
use crate::trigger::{self, TriggerDef};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Walks the tree once so queries see it immediately after `watch`.
///
/// All records from one scan share a single tick. Unreadable entries are
/// skipped; a watch must still establish over a tree with permission holes.
pub fn initial_scan(root: &Root) -> usize {
    let mut state = root.lock();
    state.clock.ticks += 1;
    let tick = state.clock.ticks;

    let mut scanned = 0;
    for entry in WalkDir::new(&root.path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&root.path) else {
            continue;
        };
        let name = rel.to_string_lossy().into_owned();
        if name.is_empty() {
            continue;
        }
        let Ok(md) = entry.metadata() else { continue };
        state.files.insert(name, FileRecord::from_metadata(&md, tick));
        scanned += 1;
    }
    scanned
}

/// Starts event delivery for a root.
///
/// The debouncer is stored on the root; `watch-del` (or shutdown) drops it,
/// which closes the channel and ends the processing task.
pub fn start(ctx: Arc<ServerContext>, root: Arc<Root>) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut debouncer = new_debouncer(DEBOUNCE_WINDOW, move |res: DebounceEventResult| {
        let _ = tx.send(res);
    })?;
    debouncer
        .watcher()
        .watch(&root.path, RecursiveMode::Recursive)?;
    root.set_watcher(debouncer);

    tokio::spawn(async move {
        while let Some(res) = rx.recv().await {
            match res {
                Ok(events) => process_batch(&ctx, &root, events),
                Err(e) => {
                    daemon_log("watcher", &format!("{}: {}", root.path.display(), e));
                }
            }
        }
        daemon_log("watcher", &format!("stopped watching {}", root.path.display()));
    });
    Ok(())
}

fn process_batch(ctx: &Arc<ServerContext>, root: &Arc<Root>, events: Vec<DebouncedEvent>) {
    let mut paths: BTreeSet<PathBuf> = BTreeSet::new();
    for event in events {
        if matches!(event.kind, DebouncedEventKind::Any) {
            paths.insert(event.path);
        }
    }
    if paths.is_empty() {
        return;
    }

    let mut fired: Vec<(TriggerDef, Vec<String>)> = Vec::new();
    {
        let mut state = root.lock();
        state.clock.ticks += 1;
        let tick = state.clock.ticks;

        let mut changed: Vec<String> = Vec::new();
        for path in paths {
            let Ok(rel) = path.strip_prefix(&root.path) else {
                continue;
            };
            let name = rel.to_string_lossy().into_owned();
            if name.is_empty() {
                continue;
            }
            match std::fs::symlink_metadata(&path) {
                Ok(md) if md.is_dir() => continue,
                Ok(md) => {
                    state
                        .files
                        .entry(name.clone())
                        .and_modify(|rec| rec.update_from_metadata(&md, tick))
                        .or_insert_with(|| FileRecord::from_metadata(&md, tick));
                    changed.push(name);
                }
                Err(_) => {
                    // Only files we knew about produce a deletion record.
                    if let Some(rec) = state.files.get_mut(&name) {
                        if rec.exists {
                            rec.mark_deleted(tick);
                            changed.push(name);
                        }
                    }
                }
            }
        }
        if changed.is_empty() {
            return;
        }

        fanout::notify_root_advanced(ctx, root, &mut state);

        for def in state.triggers.values() {
            let Ok(matcher) = def.matcher() else { continue };
            let hits: Vec<String> = changed
                .iter()
                .filter(|name| matcher.is_match(name.as_str()))
                .cloned()
                .collect();
            if !hits.is_empty() {
                fired.push((def.clone(), hits));
            }
        }
    }

    for (def, files) in fired {
        trigger::fire(&ctx.children, &root.path, &def, &files);
    }
}
