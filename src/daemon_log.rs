//! Shared file debug logging for daemon components.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static ECHO_STDERR: AtomicBool = AtomicBool::new(false);

/// Overrides the debug log destination (the `--logfile` flag). Defaults to
/// `<base>/debug.log`. First call wins.
pub fn set_log_path(path: PathBuf) {
    let _ = LOG_PATH.set(path);
}

/// Mirrors debug log lines to stderr. Set when running in the foreground.
pub fn set_echo_stderr(echo: bool) {
    ECHO_STDERR.store(echo, Ordering::Relaxed);
}

/// Appends a timestamped line to the debug log.
///
/// The `tag` identifies the source module (e.g. "server", "watcher",
/// "reaper"). Logging failures are swallowed; this must never take the
/// daemon down.
pub fn daemon_log(tag: &str, msg: &str) {
    let now = chrono::Local::now().format("%H:%M:%S%.3f");
    if ECHO_STDERR.load(Ordering::Relaxed) {
        eprintln!("[{}] [{}] {}", now, tag, msg);
    }

    let log_path = match LOG_PATH.get() {
        Some(path) => path.clone(),
        None => match crate::paths::debug_log_path() {
            Ok(path) => path,
            Err(_) => return,
        },
    };
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        let _ = writeln!(file, "[{}] [{}] {}", now, tag, msg);
    }
}
