//! Persisted daemon state: the watch list and trigger definitions.
//!
//! File contents are never persisted; trees are re-scanned when a watch is
//! re-established on startup. A missing or unreadable state file is
//! tolerated (logged and skipped), a failed save is logged and swallowed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::daemon_log::daemon_log;
use crate::protocol::DAEMON_VERSION;
use crate::server::ServerContext;
use crate::trigger::TriggerDef;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SavedState {
    pub version: String,
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    /// Trigger definitions keyed by the root path they belong to.
    #[serde(default)]
    pub triggers: BTreeMap<String, Vec<TriggerDef>>,
}

/// Captures the current watch list and triggers.
pub fn snapshot(ctx: &ServerContext) -> SavedState {
    let mut state = SavedState {
        version: DAEMON_VERSION.to_string(),
        ..Default::default()
    };
    for root in ctx.roots.all() {
        state.roots.push(root.path.clone());
        let root_state = root.lock();
        if !root_state.triggers.is_empty() {
            state.triggers.insert(
                root.path.display().to_string(),
                root_state.triggers.values().cloned().collect(),
            );
        }
    }
    state.roots.sort();
    state
}

/// Writes the state file. Called on every watch/trigger mutation and on
/// shutdown.
pub fn save(ctx: &ServerContext) -> Result<()> {
    let state = snapshot(ctx);
    let content = serde_json::to_string_pretty(&state).context("Failed to serialize state")?;
    std::fs::write(&ctx.state_file, content)
        .with_context(|| format!("Failed to write state file {}", ctx.state_file.display()))?;
    Ok(())
}

/// Re-establishes persisted watches and triggers on startup.
///
/// Roots whose directory no longer exists are skipped with a log line; the
/// rest of the file still loads.
pub async fn load(ctx: &Arc<ServerContext>) -> Result<()> {
    if !ctx.state_file.exists() {
        return Ok(());
    }
    let content = std::fs::read_to_string(&ctx.state_file)
        .with_context(|| format!("Failed to read state file {}", ctx.state_file.display()))?;
    let state: SavedState =
        serde_json::from_str(&content).context("Failed to parse state file")?;

    for path in &state.roots {
        let name = path.display().to_string();
        match ctx.resolve_root(&name, true).await {
            Ok(root) => {
                if let Some(defs) = state.triggers.get(&name) {
                    let mut root_state = root.lock();
                    for def in defs {
                        root_state.triggers.insert(def.name.clone(), def.clone());
                    }
                }
            }
            Err(e) => {
                daemon_log("state", &format!("skipping saved root {}: {}", name, e));
            }
        }
    }
    Ok(())
}
