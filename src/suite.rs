//! Test suites: cases describing matches a player must pass.
//!
//! A suite is declared with a [`SuiteBuilder`]. Matches run in an environment holding the
//! code changes declared before them; changing the code after a match was declared starts a
//! new environment, so every match sees exactly the changes declared above it.
//!
//! ```no_run
//! # use bcpm::prelude::*;
//! # fn main() -> anyhow::Result<()> {
//! let ids = IdAllocator::new();
//! let mut builder = SuiteBuilder::new(&ids);
//! builder.map("fortress").vs("rival");
//! builder.replace_class("team000.Strategy", "tests.AggressiveStrategy");
//! builder.match_with(|m| {
//!     m.it("wins", |t| should_win(t));
//!     m.it("stays quiet", |t| should_not_throw(t));
//! })?;
//! let suite = builder.build();
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    io::Write,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context};
use tracing::{info, instrument, warn};

use crate::{
    assertions::AssertionError,
    build_runner::Options,
    environment::Environment,
    ids::IdAllocator,
    outcome::Side,
    scheduler::{self, MatchExecutor},
    test_match::TestMatch,
    transplant::{StubCall, TransplantOp},
    workspace::single_package,
};

/// Checkout of a test suite: the code transplanted into environments.
#[derive(Debug, Clone)]
pub struct SuiteTree {
    path: PathBuf,
    target_player: String,
}

impl SuiteTree {
    /// `target_player` is the player package the suite code refers to.
    pub fn new(path: impl Into<PathBuf>, target_player: impl Into<String>) -> SuiteTree {
        SuiteTree {
            path: path.into(),
            target_player: target_player.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn target_player(&self) -> &str {
        &self.target_player
    }

    /// The suite's only source package, whatever its name.
    pub fn package_path(&self) -> anyhow::Result<PathBuf> {
        single_package(&self.path, None)
            .with_context(|| format!("invalid test suite at {}", self.path.display()))
    }
}

/// Verdict on a finished match.
pub type Check = Box<dyn Fn(&TestMatch) -> anyhow::Result<()> + Send + Sync>;

/// One expectation about one match.
pub struct TestCase {
    label: String,
    test_match: Arc<TestMatch>,
    check: Check,
}

impl TestCase {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn test_match(&self) -> &Arc<TestMatch> {
        &self.test_match
    }

    /// Conditions of the match followed by the label.
    pub fn description(&self) -> String {
        format!("{} {}", self.test_match, self.label)
    }

    /// Runs the check. A panicking check is reported as an error.
    pub fn check_output(&self) -> anyhow::Result<()> {
        panic::catch_unwind(AssertUnwindSafe(|| (self.check)(&self.test_match))).unwrap_or_else(
            |payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                Err(anyhow!("check panicked: {message}"))
            },
        )
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("label", &self.label)
            .field("test_match", &self.test_match.to_string())
            .finish_non_exhaustive()
    }
}

/// Declares the cases of a match.
pub struct MatchScope<'b> {
    test_match: &'b Arc<TestMatch>,
    cases: &'b mut Vec<TestCase>,
}

impl MatchScope<'_> {
    pub fn it<F>(&mut self, label: impl Into<String>, check: F) -> &mut Self
    where
        F: Fn(&TestMatch) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.cases.push(TestCase {
            label: label.into(),
            test_match: self.test_match.clone(),
            check: Box::new(check),
        });
        self
    }
}

/// Declares a suite, statement by statement.
pub struct SuiteBuilder<'a> {
    ids: &'a IdAllocator,
    map: Option<String>,
    vs: Option<String>,
    side: Side,
    options: Options,
    environment: Arc<Environment>,
    environment_used: bool,
    environments: Vec<Arc<Environment>>,
    matches: Vec<Arc<TestMatch>>,
    cases: Vec<TestCase>,
}

impl<'a> SuiteBuilder<'a> {
    /// Environments are named by `ids`.
    pub fn new(ids: &'a IdAllocator) -> SuiteBuilder<'a> {
        SuiteBuilder {
            ids,
            map: None,
            vs: None,
            side: Side::A,
            options: Options::new(),
            environment: Arc::new(Environment::new(ids.next_environment_name())),
            environment_used: false,
            environments: vec![],
            matches: vec![],
            cases: vec![],
        }
    }

    /// Map of the following matches.
    pub fn map(&mut self, map: impl Into<String>) -> &mut Self {
        self.map = Some(map.into());
        self
    }

    /// Opponent of the following matches.
    pub fn vs(&mut self, player: impl Into<String>) -> &mut Self {
        self.vs = Some(player.into());
        self
    }

    /// Side played by the tested player in the following matches. Defaults to A.
    pub fn side(&mut self, side: Side) -> &mut Self {
        self.side = side;
        self
    }

    /// Sets a simulator option for the following matches, or removes it with `None`.
    pub fn option(&mut self, key: impl Into<String>, value: Option<&str>) -> &mut Self {
        let key = key.into();
        match value {
            Some(value) => self.options.insert(key, value.to_owned()),
            None => self.options.remove(&key),
        };
        self
    }

    fn environment_change(&mut self) {
        if self.environment_used {
            let fresh = Arc::new(Environment::new(self.ids.next_environment_name()));
            self.environments
                .push(std::mem::replace(&mut self.environment, fresh));
            self.environment_used = false;
        }
    }

    /// Plugs the suite class `source` into the player as `target`.
    pub fn add_class(&mut self, target: impl Into<String>, source: impl Into<String>) -> &mut Self {
        self.environment_change();
        self.environment.queue_file_operation(TransplantOp::CopyFile {
            target: target.into(),
            source: source.into(),
        });
        self
    }

    /// Replaces the player class `target` with the suite class `source`.
    pub fn replace_class(&mut self, target: impl Into<String>, source: impl Into<String>) -> &mut Self {
        self.add_class(target, source)
    }

    /// Replaces the fragments labeled `target_label` in `target` with the fragment labeled
    /// `source_label` in `source`.
    pub fn replace_code(
        &mut self,
        target: impl Into<String>,
        target_label: impl Into<String>,
        source: impl Into<String>,
        source_label: impl Into<String>,
    ) -> &mut Self {
        self.environment_change();
        self.environment.queue_file_operation(TransplantOp::CopyFragment {
            target: target.into(),
            target_label: target_label.into(),
            source: source.into(),
            source_label: source_label.into(),
        });
        self
    }

    /// Redirects every call of `method` to the static method `target`.
    pub fn stub_call(&mut self, method: &str, target: &str) -> anyhow::Result<&mut Self> {
        let stub = StubCall::new(method, target)?;
        self.environment_change();
        self.environment.queue_patch_operation(stub);
        Ok(self)
    }

    /// Declares a match with the current settings; `cases` declares what it must show.
    pub fn match_with<F>(&mut self, cases: F) -> anyhow::Result<&mut Self>
    where
        F: FnOnce(&mut MatchScope),
    {
        let (Some(map), Some(vs)) = (&self.map, &self.vs) else {
            bail!("a match needs a map and an opponent");
        };
        let test_match = Arc::new(TestMatch::new(
            self.side,
            vs.clone(),
            map.clone(),
            self.environment.clone(),
            self.options.clone(),
        ));
        self.environment_used = true;
        cases(&mut MatchScope {
            test_match: &test_match,
            cases: &mut self.cases,
        });
        self.matches.push(test_match);
        Ok(self)
    }

    pub fn build(mut self) -> Suite {
        if self.environment_used {
            self.environments.push(self.environment);
        }
        Suite {
            environments: self.environments,
            matches: self.matches,
            cases: self.cases,
        }
    }
}

/// Declared cases, with the environments and matches they need.
#[derive(Debug)]
pub struct Suite {
    environments: Vec<Arc<Environment>>,
    matches: Vec<Arc<TestMatch>>,
    cases: Vec<TestCase>,
}

/// A case that did not pass.
#[derive(Debug, Clone)]
pub struct SuiteFailure {
    pub description: String,
    /// Assertion message or error chain.
    pub detail: String,
    /// Where the replay and transcript of the match were saved.
    pub stash: String,
}

/// Counters of a suite run. Skipped cases are counted in `total`.
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub failures: Vec<SuiteFailure>,
}

impl SuiteReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} tests, {} passed, {} failures, {} errors, {} skipped",
            self.total, self.passed, self.failed, self.errors, self.skipped
        )?;
        for (i, failure) in self.failures.iter().enumerate() {
            writeln!(f, "\n{:3}) Failed {}", i + 1, failure.description)?;
            write!(f, "{}", failure.stash)?;
            writeln!(f, "{}", failure.detail)?;
        }
        Ok(())
    }
}

impl Suite {
    pub fn environments(&self) -> &[Arc<Environment>] {
        &self.environments
    }

    pub fn matches(&self) -> &[Arc<TestMatch>] {
        &self.matches
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    /// Runs the matches of available environments, then checks every case.
    ///
    /// Replays of failing matches are saved in `cache_dir`. Only an aborted match batch is an
    /// error; failing cases are reported.
    #[instrument(skip_all, fields(cases = self.cases.len()))]
    pub fn run<E: MatchExecutor + ?Sized>(
        &self,
        executor: &E,
        workers: usize,
        cache_dir: &Path,
        verbose: bool,
    ) -> anyhow::Result<SuiteReport> {
        let pending: Vec<Arc<TestMatch>> = self
            .matches
            .iter()
            .filter(|m| m.environment().is_available() && !m.ran())
            .cloned()
            .collect();
        info!("running {} matches", pending.len());
        scheduler::drain(pending, workers, executor, |_| {})?;

        let mut report = SuiteReport {
            total: self.cases.len(),
            ..SuiteReport::default()
        };
        for case in &self.cases {
            if !case.test_match().environment().is_available() {
                report.skipped += 1;
                continue;
            }
            let detail = match case.check_output() {
                Ok(()) => {
                    report.passed += 1;
                    progress(verbose, '.');
                    continue;
                }
                Err(e) if e.is::<AssertionError>() => {
                    report.failed += 1;
                    progress(verbose, 'F');
                    e.to_string()
                }
                Err(e) => {
                    report.errors += 1;
                    progress(verbose, 'E');
                    format!("{e:?}")
                }
            };
            let stash = case.test_match().stash(cache_dir).unwrap_or_else(|e| {
                warn!("could not save the replay: {e:#}");
                format!("No replay: {e:#}\n")
            });
            report.failures.push(SuiteFailure {
                description: case.description(),
                detail,
                stash,
            });
        }
        if verbose {
            println!("\n{report}");
        }
        Ok(report)
    }
}

fn progress(verbose: bool, mark: char) {
    if verbose {
        print!("{mark}");
        let _ = std::io::stdout().flush();
    }
}
