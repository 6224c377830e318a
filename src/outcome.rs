//! Reading match outcomes out of the engine's textual log.
//!
//! Everything here is a pure function over captured text. The engine closes every match with
//! a fixed three line footer:
//!
//! ```text
//! [server] team000 (A) wins
//! [server] Reason: The winning team destroyed the enemy base.
//! [server] -------------------- Match Finished --------------------
//! ```
//!
//! The outcome is read from the third line from the end and the reason from the second one.
//! A trailing blank line or a different footer breaks this silently: the accessors then report
//! [`NO_VICTORY`] / [`NO_REASON`] instead of failing.

use std::{fmt, sync::LazyLock};

use regex::Regex;

/// Prefix the build tool puts in front of every line printed by the engine.
pub const ENGINE_LOG_MARKER: &str = "[java] ";
/// Line closing a match; nothing after it belongs to the match.
pub const MATCH_FINISHED_MARKER: &str = "- Match Finished -";
/// Outcome reported when the footer has no victory line.
pub const NO_VICTORY: &str = "(no victory)";
/// Reason reported when the footer has no reason line.
pub const NO_REASON: &str = "(no reason)";

static SIDE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(([AB])\)").unwrap());
static UNIT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[[AB]:[A-Za-z_]+#\d+@\d+\]").unwrap());
static EXCEPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\S*)Exception:").unwrap());

/// One of the two simulation slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    A,
    B,
}

impl Side {
    /// Both sides, in scheduling order.
    pub const BOTH: [Side; 2] = [Side::A, Side::B];

    pub fn opposite(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B"),
        }
    }
}

/// Winner of a match, or [`Winner::Error`] when the log does not name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Winner {
    Side(Side),
    Error,
}

impl Winner {
    pub fn side(self) -> Option<Side> {
        match self {
            Winner::Side(side) => Some(side),
            Winner::Error => None,
        }
    }
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Winner::Side(side) => write!(f, "{side}"),
            Winner::Error => write!(f, "error"),
        }
    }
}

/// Keeps the engine lines of a build tool log, without their marker.
///
/// Reading stops after the first line carrying [`MATCH_FINISHED_MARKER`], engine line or not.
pub fn extract_engine_log(raw: &str) -> String {
    let mut lines = vec![];
    for line in raw.lines() {
        if let Some(start) = line.find(ENGINE_LOG_MARKER) {
            lines.push(&line[start + ENGINE_LOG_MARKER.len()..]);
        }
        if line.contains(MATCH_FINISHED_MARKER) {
            break;
        }
    }
    lines.join("\n")
}

fn nth_from_end<'a>(lines: &[&'a str], n: usize) -> Option<&'a str> {
    lines.len().checked_sub(n).map(|i| lines[i])
}

/// The victory line, or [`NO_VICTORY`].
pub fn outcome_line<'a>(lines: &[&'a str]) -> &'a str {
    match nth_from_end(lines, 3) {
        Some(line) if line.contains("wins") => line,
        _ => NO_VICTORY,
    }
}

/// The side named by a victory line.
pub fn winner(outcome: &str) -> Winner {
    match SIDE_TAG.captures(outcome).map(|c| c.get(1).map(|m| m.as_str())) {
        Some(Some("A")) => Winner::Side(Side::A),
        Some(Some("B")) => Winner::Side(Side::B),
        _ => Winner::Error,
    }
}

/// The line explaining why the match ended, or [`NO_REASON`].
pub fn reason_line<'a>(lines: &[&'a str]) -> &'a str {
    match nth_from_end(lines, 2) {
        Some(line) if line.contains("Reason:") => line,
        _ => NO_REASON,
    }
}

/// Console output of the units, with the `[A:TYPE#id@round]` tags stripped.
///
/// Lines without a unit tag, and lines that are empty once stripped, are dropped.
pub fn chatter(lines: &[&str]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| {
            let tag = UNIT_TAG.find(line)?;
            let text = &line[tag.end()..];
            (!text.is_empty()).then(|| text.to_owned())
        })
        .collect()
}

/// Name of the first exception reported at the start of a line, e.g. `NullPointerException`.
pub fn thrown_exception(log: &str) -> Option<String> {
    EXCEPTION
        .captures(log)
        .map(|c| format!("{}Exception", &c[1]))
}
