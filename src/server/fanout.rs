//! Subscription fan-out: couples the watcher backend to interested
//! sessions.
//!
//! Runs under the root lock after each settled change batch. For one
//! subscription, notifications are enqueued in tick order; across
//! subscriptions ordering is unspecified. A notification for a session
//! that disappeared between lookup and enqueue is dropped silently.

use serde_json::Value;

use crate::clock::ClockSpec;
use crate::files::{changed_since, render_files, FileRecord};
use crate::protocol::{annotate_with_clock, make_response};
use crate::root::{Root, RootState};

use super::ServerContext;

/// Evaluates every subscription on `root` against the files that changed
/// in `(last_ticks, current]` and pushes non-empty results to the owning
/// sessions. Must be called with the root lock held (the caller passes the
/// locked state in).
pub fn notify_root_advanced(ctx: &ServerContext, root: &Root, state: &mut RootState) {
    let current = state.clock.ticks;
    let RootState { subscriptions, files, .. } = state;

    for sub in subscriptions.iter_mut() {
        let spec = ClockSpec::Ticks { ticks: sub.last_ticks, fresh_instance: false };
        let matched: Vec<(&str, &FileRecord)> = changed_since(files, &spec)
            .into_iter()
            .filter(|(name, rec)| sub.query.matches(name, rec))
            .collect();
        sub.last_ticks = current;
        if matched.is_empty() {
            continue;
        }

        let mut notification = make_response();
        notification["subscription"] = Value::String(sub.name.clone());
        notification["root"] = Value::String(root.path.display().to_string());
        annotate_with_clock(&mut notification, current);
        notification["files"] = render_files(&matched, Some(&spec));
        notification["is_fresh_instance"] = Value::Bool(false);

        ctx.enqueue(sub.client_id, notification);
    }
}
