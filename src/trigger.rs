//! Command triggers: named pattern sets that spawn a command when matching
//! files change.
//!
//! Definitions live on the root and persist across restarts via the state
//! file. Spawned children are tracked process-wide and harvested by the
//! reaper task.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::{Child, Command};

use crate::daemon_log::daemon_log;
use crate::protocol::RequestError;

/// A persisted trigger definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDef {
    pub name: String,
    pub patterns: Vec<String>,
    pub command: Vec<String>,
}

impl TriggerDef {
    /// Compiles the pattern set. Definitions are validated at registration
    /// time, so failures here mean a corrupted state file.
    pub fn matcher(&self) -> Result<GlobSet, RequestError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.patterns {
            let glob = Glob::new(pattern).map_err(|e| RequestError::Collaborator {
                message: format!("bad trigger pattern '{}': {}", pattern, e),
            })?;
            builder.add(glob);
        }
        builder.build().map_err(|e| RequestError::Collaborator {
            message: format!("failed to compile trigger patterns: {}", e),
        })
    }

    pub fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "patterns": self.patterns,
            "command": self.command,
        })
    }
}

/// Parses `["trigger", <root>, <name>, <pattern…>, "--", <cmd…>]` starting
/// at the name argument.
pub fn parse_trigger_args(args: &[Value]) -> Result<TriggerDef, RequestError> {
    let name = args
        .get(2)
        .ok_or(RequestError::WrongArgCount)?
        .as_str()
        .ok_or_else(|| RequestError::BadArgType {
            index: 2,
            expected: "a string naming the trigger".into(),
        })?;

    let mut patterns = Vec::new();
    let mut command = Vec::new();
    let mut seen_sep = false;
    for (i, arg) in args.iter().enumerate().skip(3) {
        let s = arg.as_str().ok_or_else(|| RequestError::BadArgType {
            index: i,
            expected: "a string".into(),
        })?;
        if !seen_sep && s == "--" {
            seen_sep = true;
            continue;
        }
        if seen_sep {
            command.push(s.to_string());
        } else {
            patterns.push(s.to_string());
        }
    }

    if patterns.is_empty() {
        return Err(RequestError::Collaborator {
            message: "trigger definition requires at least one pattern".into(),
        });
    }
    if command.is_empty() {
        return Err(RequestError::Collaborator {
            message: "trigger definition requires a command after '--'".into(),
        });
    }

    let def = TriggerDef {
        name: name.to_string(),
        patterns,
        command,
    };
    // Surface bad globs at registration, not at fire time.
    def.matcher()?;
    Ok(def)
}

/// Spawns the trigger command with the changed file names appended,
/// recording the child for the reaper.
pub fn fire(children: &Mutex<Vec<Child>>, root: &Path, def: &TriggerDef, files: &[String]) {
    let spawned = Command::new(&def.command[0])
        .args(&def.command[1..])
        .args(files)
        .current_dir(root)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    match spawned {
        Ok(child) => {
            daemon_log(
                "trigger",
                &format!("fired '{}' in {} for {} file(s)", def.name, root.display(), files.len()),
            );
            children.lock().push(child);
        }
        Err(e) => {
            daemon_log("trigger", &format!("failed to spawn '{}': {}", def.name, e));
        }
    }
}

/// Harvests exited trigger children. Returns how many were reaped.
pub fn reap_children(children: &Mutex<Vec<Child>>) -> usize {
    let mut kids = children.lock();
    let before = kids.len();
    kids.retain_mut(|child| match child.try_wait() {
        Ok(Some(status)) => {
            daemon_log("reaper", &format!("child exited: {}", status));
            false
        }
        Ok(None) => true,
        Err(e) => {
            daemon_log("reaper", &format!("try_wait failed: {}", e));
            false
        }
    });
    before - kids.len()
}
