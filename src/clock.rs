//! Per-root logical clock, named cursors, and clockspec parsing.
//!
//! A root's history is a monotonically nondecreasing `ticks` counter; the
//! pair (server pid, ticks) names a moment in that history, rendered as the
//! string `c:<pid>:<ticks>`. Cursors are named bookmarks into the tick
//! sequence, promoted on every reference.

use std::collections::HashMap;

use serde_json::Value;

use crate::protocol::RequestError;

/// A root's logical tick counter. Nondecreasing for the process lifetime.
pub type Ticks = u32;

/// Renders the clock id string `c:<pid>:<ticks>` for this process.
pub fn clock_id(ticks: Ticks) -> String {
    format!("c:{}:{}", std::process::id(), ticks)
}

/// The clocked portion of a root's state: the tick counter and the cursor
/// table. Mutated only while the root lock is held.
#[derive(Debug, Default)]
pub struct RootClock {
    pub ticks: Ticks,
    pub cursors: HashMap<String, Ticks>,
}

/// A resolved "since" specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockSpec {
    /// Wall-clock since: include files with mtime/ctime at or after this
    /// UNIX timestamp.
    Timestamp(i64),
    /// Tick-based since. `fresh_instance` is set when the referenced
    /// server incarnation or cursor is unknown to this process, signaling
    /// that the result must be treated as a full initial snapshot.
    Ticks { ticks: Ticks, fresh_instance: bool },
}

impl ClockSpec {
    pub fn is_fresh_instance(&self) -> bool {
        matches!(self, ClockSpec::Ticks { fresh_instance: true, .. })
    }
}

/// Parses a clockspec value against a root's clock state.
///
/// Accepted inputs:
/// - an integer UNIX timestamp;
/// - `c:<pid>:<ticks>`: if the pid is ours and the ticks equal the current
///   root ticks, the root clock is bumped so an identical repeat query
///   cannot re-observe the same set; a foreign pid resolves to
///   `ticks=0, fresh_instance=true` without bumping;
/// - `n:<label>` (when `allow_cursor`): resolves the named cursor, then
///   bumps the clock and stores the new value as the cursor's tick, so
///   back-to-back queries on one cursor never both observe a change.
///
/// Must be called with the root locked when `clock` is supplied.
pub fn parse_clockspec(
    value: &Value,
    mut clock: Option<&mut RootClock>,
    allow_cursor: bool,
) -> Result<ClockSpec, RequestError> {
    if let Some(secs) = value.as_i64() {
        return Ok(ClockSpec::Timestamp(secs));
    }

    let bad = || RequestError::BadClockSpec {
        value: value.to_string(),
    };

    let s = value.as_str().ok_or_else(bad)?;

    if allow_cursor && s.starts_with("n:") {
        let clock = clock.ok_or_else(bad)?;
        let prior = clock.cursors.get(s).copied();
        let spec = ClockSpec::Ticks {
            ticks: prior.unwrap_or(0),
            fresh_instance: prior.is_none(),
        };
        // Promote the cursor past the current tick so that repeated queries
        // when nothing has changed won't keep returning the same files.
        clock.ticks += 1;
        clock.cursors.insert(s.to_string(), clock.ticks);
        return Ok(spec);
    }

    if let Some(rest) = s.strip_prefix("c:") {
        let (pid_s, ticks_s) = rest.split_once(':').ok_or_else(bad)?;
        let pid: u32 = pid_s.parse().map_err(|_| bad())?;
        let ticks: Ticks = ticks_s.parse().map_err(|_| bad())?;

        if pid == std::process::id() {
            if let Some(clock) = clock.as_deref_mut() {
                if ticks == clock.ticks {
                    // Force an increment so the caller's next identical
                    // query names a strictly newer moment.
                    clock.ticks += 1;
                }
            }
            return Ok(ClockSpec::Ticks {
                ticks,
                fresh_instance: false,
            });
        }
        // A different incarnation of the server: the caller has never
        // spoken to us, so they get a full snapshot.
        return Ok(ClockSpec::Ticks {
            ticks: 0,
            fresh_instance: true,
        });
    }

    Err(bad())
}
