//! Background harvesting of exited trigger children.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::trigger;

use super::ServerContext;

const REAP_INTERVAL: Duration = Duration::from_millis(200);

/// Spawns the reaper task. It polls for exited children every 200 ms and
/// winds down on the shutdown broadcast, taking one final pass so no child
/// outlives the daemon unharvested.
pub fn spawn(ctx: Arc<ServerContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = ctx.subscribe_shutdown();
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    trigger::reap_children(&ctx.children);
                }
                _ = shutdown_rx.recv() => {
                    trigger::reap_children(&ctx.children);
                    break;
                }
            }
        }
    })
}
