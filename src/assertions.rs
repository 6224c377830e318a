//! Checks run by test cases against a finished match.
//!
//! Every check returns an [`AssertionError`] pointing at the line of the test case that made
//! it, so reports blame the suite code and not the harness.

use std::{error::Error, fmt, panic::Location};

use crate::{
    outcome::{self, Winner},
    test_match::{MatchLog, TestMatch},
};

/// A test case expectation that the match did not meet.
#[derive(Debug)]
pub struct AssertionError {
    message: String,
    location: &'static Location<'static>,
}

impl AssertionError {
    #[track_caller]
    pub fn new(message: impl Into<String>) -> AssertionError {
        AssertionError {
            message: message.into(),
            location: Location::caller(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Where the failing check was written.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl fmt::Display for AssertionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n  at {}", self.message, self.location)
    }
}

impl Error for AssertionError {}

#[track_caller]
fn finished(test_match: &TestMatch) -> Result<&MatchLog, AssertionError> {
    match test_match.log() {
        Some(log) => Ok(log),
        None => Err(AssertionError::new(format!("match {test_match} did not run"))),
    }
}

/// Fails unless the tested player won.
#[track_caller]
pub fn should_win(test_match: &TestMatch) -> anyhow::Result<()> {
    let log = finished(test_match)?;
    if log.winner() == Winner::Side(test_match.side()) {
        return Ok(());
    }
    Err(AssertionError::new(format!(
        "Player was expected to win, but did not. {}",
        log.outcome()
    ))
    .into())
}

/// Fails unless the tested player lost.
#[track_caller]
pub fn should_lose(test_match: &TestMatch) -> anyhow::Result<()> {
    let log = finished(test_match)?;
    if log.winner() == Winner::Side(test_match.side().opposite()) {
        return Ok(());
    }
    Err(AssertionError::new(format!(
        "Player was expected to lose, but did not. {}",
        log.outcome()
    ))
    .into())
}

/// Fails unless the tested player won and the reason line mentions `reason`.
#[track_caller]
pub fn should_win_by(test_match: &TestMatch, reason: &str) -> anyhow::Result<()> {
    should_win(test_match)?;
    let log = finished(test_match)?;
    if log.reason().contains(reason) {
        return Ok(());
    }
    Err(AssertionError::new(format!(
        "Player was expected to win by {reason} and didn't. {}",
        log.reason()
    ))
    .into())
}

/// Fails if the player code threw any exception.
#[track_caller]
pub fn should_not_throw(test_match: &TestMatch) -> anyhow::Result<()> {
    let log = finished(test_match)?;
    match outcome::thrown_exception(log.output()) {
        None => Ok(()),
        Some(exception) => Err(AssertionError::new(format!(
            "Player should not have thrown exceptions. It threw {exception}"
        ))
        .into()),
    }
}
