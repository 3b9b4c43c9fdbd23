//! Response envelopes and the client-facing error taxonomy.
//!
//! Every response carries a top-level `version` string; responses from
//! query-style handlers additionally carry a `clock` string captured under
//! the root lock. Errors are rendered as `{"error": <message>}` with the
//! exact messages clients key on.

use serde_json::{json, Value};

use crate::clock::{clock_id, Ticks};

/// Version string reported in every response and by the `version` command.
pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds the base response object with the `version` field set.
pub fn make_response() -> Value {
    json!({ "version": DAEMON_VERSION })
}

/// Adds the current clock of a root to a response.
///
/// Must be called while the root lock is held so the reported clock is the
/// one the answer was computed at.
pub fn annotate_with_clock(resp: &mut Value, ticks: Ticks) {
    resp["clock"] = Value::String(clock_id(ticks));
}

/// A request failure reported to the client as an `error` response.
///
/// Request-shape and clockspec errors leave the session open; only decode
/// errors (handled in the session loop, not here) terminate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The request array was empty (or not an array at all).
    EmptyRequest,
    /// Element 0 of the request was not a string.
    BadCommandName,
    /// Element 0 named no registered command.
    UnknownCommand { name: String },
    /// A required positional argument was missing.
    WrongArgCount,
    /// An argument had the wrong type.
    BadArgType { index: usize, expected: String },
    /// The root resolver failed; carries the resolver's message.
    UnresolvedRoot { root: String, message: String },
    /// An unparseable since-value.
    BadClockSpec { value: String },
    /// Bubbled up from the query, watch, or trigger engines.
    Collaborator { message: String },
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::EmptyRequest => {
                write!(f, "invalid command (expected an array with some elements!)")
            }
            RequestError::BadCommandName => {
                write!(f, "invalid command: expected element 0 to be the command name")
            }
            RequestError::UnknownCommand { name } => write!(f, "unknown command {}", name),
            RequestError::WrongArgCount => write!(f, "wrong number of arguments"),
            RequestError::BadArgType { index, expected } => {
                write!(f, "invalid value for argument {}, expected {}", index, expected)
            }
            RequestError::UnresolvedRoot { root, message } => {
                write!(f, "unable to resolve root {}: {}", root, message)
            }
            RequestError::BadClockSpec { value } => write!(f, "invalid clockspec {}", value),
            RequestError::Collaborator { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for RequestError {}

/// Renders a request failure into an error response object.
pub fn error_response(err: &RequestError) -> Value {
    let mut resp = make_response();
    resp["error"] = Value::String(err.to_string());
    resp
}
