//! Log levels and the client broadcast log sink.
//!
//! Any connected session can opt into server logs with `log-level`; every
//! line at or above its filter is delivered as an unsolicited
//! `{version, log}` response.

use serde_json::Value;

use crate::daemon_log::daemon_log;
use crate::protocol::make_response;

use super::ServerContext;

/// A session's log filter, ordered from quietest to chattiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Off,
    Error,
    Info,
    Debug,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(LogLevel::Off),
            "error" => Some(LogLevel::Error),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivers a log line to every session whose filter admits `level`.
///
/// Enqueue failures mean the session is tearing down; the line is dropped
/// for that session.
pub fn log_to_clients(ctx: &ServerContext, level: LogLevel, text: &str) {
    for tx in ctx.log_recipients(level) {
        let mut resp = make_response();
        resp["log"] = Value::String(text.to_string());
        let _ = tx.send(resp);
    }
}

/// Server-side log entry point: the file debug log plus the client sink.
pub fn server_log(ctx: &ServerContext, level: LogLevel, text: &str) {
    daemon_log(level.as_str(), text);
    log_to_clients(ctx, level, text);
}
