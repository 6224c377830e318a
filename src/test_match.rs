use std::{
    fmt,
    path::Path,
    sync::{Arc, OnceLock},
};

use anyhow::Context;
use tracing::{info, instrument, warn};

use crate::{
    build_runner::{BuildRunner, Options},
    environment::Environment,
    ids::IdAllocator,
    outcome::{self, Side, Winner},
};

#[derive(Debug)]
struct Footer {
    outcome: String,
    winner: Winner,
    reason: String,
}

/// What a finished match produced. Derived values are computed on first access.
#[derive(Debug)]
pub struct MatchLog {
    run_id: String,
    output: String,
    replay: Vec<u8>,
    transcript: String,
    footer: OnceLock<Footer>,
    chatter: OnceLock<Vec<String>>,
}

impl MatchLog {
    /// `output` is the engine log, already filtered out of the build tool log.
    pub fn new(
        run_id: impl Into<String>,
        output: impl Into<String>,
        replay: Vec<u8>,
        transcript: impl Into<String>,
    ) -> MatchLog {
        MatchLog {
            run_id: run_id.into(),
            output: output.into(),
            replay,
            transcript: transcript.into(),
            footer: OnceLock::new(),
            chatter: OnceLock::new(),
        }
    }

    /// A log with no replay data, e.g. a saved engine log.
    pub fn from_output(run_id: impl Into<String>, output: impl Into<String>) -> MatchLog {
        MatchLog::new(run_id, output, vec![], "")
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn replay(&self) -> &[u8] {
        &self.replay
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    fn footer(&self) -> &Footer {
        self.footer.get_or_init(|| {
            let lines: Vec<&str> = self.output.lines().collect();
            let outcome = outcome::outcome_line(&lines).to_owned();
            Footer {
                winner: outcome::winner(&outcome),
                reason: outcome::reason_line(&lines).to_owned(),
                outcome,
            }
        })
    }

    /// Victory line, or [`outcome::NO_VICTORY`].
    pub fn outcome(&self) -> &str {
        &self.footer().outcome
    }

    pub fn winner(&self) -> Winner {
        self.footer().winner
    }

    /// Reason line, or [`outcome::NO_REASON`].
    pub fn reason(&self) -> &str {
        &self.footer().reason
    }

    /// Console output of the units.
    pub fn chatter(&self) -> &[String] {
        self.chatter.get_or_init(|| {
            let lines: Vec<&str> = self.output.lines().collect();
            outcome::chatter(&lines)
        })
    }
}

/// One scheduled simulation of an environment's player against an opponent.
#[derive(Debug)]
pub struct TestMatch {
    side: Side,
    vs: String,
    map: String,
    options: Options,
    environment: Arc<Environment>,
    log: OnceLock<MatchLog>,
}

impl TestMatch {
    pub fn new(
        side: Side,
        vs: impl Into<String>,
        map: impl Into<String>,
        environment: Arc<Environment>,
        options: Options,
    ) -> TestMatch {
        TestMatch {
            side,
            vs: vs.into(),
            map: map.into(),
            options,
            environment,
            log: OnceLock::new(),
        }
    }

    /// Side played by the environment's player.
    pub fn side(&self) -> Side {
        self.side
    }

    pub fn vs(&self) -> &str {
        &self.vs
    }

    pub fn map(&self) -> &str {
        &self.map
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    pub fn ran(&self) -> bool {
        self.log.get().is_some()
    }

    /// The captured log, once the match ran.
    pub fn log(&self) -> Option<&MatchLog> {
        self.log.get()
    }

    /// Stores the result of a run. Returns `false` when the match already had one.
    pub fn record(&self, log: MatchLog) -> bool {
        self.log.set(log).is_ok()
    }

    /// Winner of the match, [`Winner::Error`] until it ran.
    pub fn winner(&self) -> Winner {
        self.log().map_or(Winner::Error, MatchLog::winner)
    }

    /// Overrides for the simulator configuration.
    ///
    /// Only the tested player's output is kept; explicit options win over everything else.
    pub fn simulator_config(&self) -> Options {
        let player = self.environment.name().to_owned();
        let (team_a, team_b) = match self.side {
            Side::A => (player, self.vs.clone()),
            Side::B => (self.vs.clone(), player),
        };
        let mut config = Options::from([
            ("bc.engine.silence-a".to_owned(), (self.side != Side::A).to_string()),
            ("bc.engine.silence-b".to_owned(), (self.side != Side::B).to_string()),
            ("bc.dialog.skip".to_owned(), "true".to_owned()),
            ("bc.game.maps".to_owned(), self.map.clone()),
            ("bc.game.team-a".to_owned(), team_a),
            ("bc.game.team-b".to_owned(), team_b),
        ]);
        config.extend(self.options.clone());
        config
    }

    /// Runs the simulation, unless the match already ran.
    #[instrument(skip_all, fields(environment = self.environment.name(), map = %self.map, side = %self.side))]
    pub fn run(&self, runner: &BuildRunner, ids: &IdAllocator, live: bool) -> anyhow::Result<()> {
        if self.ran() {
            return Ok(());
        }
        let output = runner.run_simulation(&self.simulator_config(), live)?;
        let log = MatchLog::new(
            ids.next_run_id(),
            outcome::extract_engine_log(&output.log),
            output.replay,
            output.transcript,
        );
        info!(run_id = log.run_id(), winner = %log.winner(), "match finished");
        if !self.record(log) {
            warn!("match {} ran twice, keeping the first result", self);
        }
        Ok(())
    }

    /// Saves the replay and transcript to `cache_dir` and says where to find them.
    pub fn stash(&self, cache_dir: &Path) -> anyhow::Result<String> {
        let log = self.log().context("the match did not run")?;
        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("could not create {}", cache_dir.display()))?;
        let replay = cache_dir.join(format!("{}.rms", log.run_id()));
        let transcript = cache_dir.join(format!("{}.txt", log.run_id()));
        std::fs::write(&replay, log.replay())
            .with_context(|| format!("could not write {}", replay.display()))?;
        std::fs::write(&transcript, log.transcript())
            .with_context(|| format!("could not write {}", transcript.display()))?;
        Ok(format!(
            "Transcript: {}\nReplay:     {}\n",
            transcript.display(),
            replay.display()
        ))
    }
}

impl fmt::Display for TestMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vs {} on {} as {}", self.vs, self.map, self.side)
    }
}

#[cfg(test)]
mod test_match_tests {
    use super::*;
    use crate::outcome::{NO_REASON, NO_VICTORY};

    fn test_match(side: Side) -> TestMatch {
        TestMatch::new(
            side,
            "rival",
            "fortress",
            Arc::new(Environment::new("bcpmtest_0_1")),
            Options::from([("bc.engine.debug-methods".to_owned(), "true".to_owned())]),
        )
    }

    #[test]
    fn side_decides_teams_and_silence() {
        let a = test_match(Side::A).simulator_config();
        assert_eq!(a["bc.game.team-a"], "bcpmtest_0_1");
        assert_eq!(a["bc.game.team-b"], "rival");
        assert_eq!(a["bc.engine.silence-a"], "false");
        assert_eq!(a["bc.engine.silence-b"], "true");
        assert_eq!(a["bc.engine.debug-methods"], "true");

        let b = test_match(Side::B).simulator_config();
        assert_eq!(b["bc.game.team-a"], "rival");
        assert_eq!(b["bc.game.team-b"], "bcpmtest_0_1");
        assert_eq!(b["bc.engine.silence-a"], "true");
        assert_eq!(b["bc.engine.silence-b"], "false");
        assert_eq!(b["bc.game.maps"], "fortress");
    }

    #[test]
    fn recording_is_final() {
        let m = test_match(Side::A);
        assert!(!m.ran());
        assert_eq!(m.winner(), Winner::Error);
        assert!(m.record(MatchLog::from_output("r1", "x\n(B) wins\nReason: y\nz")));
        assert!(m.ran());
        assert!(!m.record(MatchLog::from_output("r2", "")));
        assert_eq!(m.log().unwrap().run_id(), "r1");
        assert_eq!(m.winner(), Winner::Side(Side::B));
        assert_eq!(m.log().unwrap().reason(), "Reason: y");
    }

    #[test]
    fn short_output_falls_back() {
        let log = MatchLog::from_output("r", "only line");
        assert_eq!(log.outcome(), NO_VICTORY);
        assert_eq!(log.reason(), NO_REASON);
        assert_eq!(log.winner(), Winner::Error);
        assert!(log.chatter().is_empty());
    }

    #[test]
    fn stash_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let m = test_match(Side::A);
        assert!(m.stash(dir.path()).is_err());
        m.record(MatchLog::new("run_7", "log", vec![1, 2, 3], "transcript"));
        let text = m.stash(dir.path()).unwrap();
        assert!(text.contains("run_7.txt"));
        assert_eq!(std::fs::read(dir.path().join("run_7.rms")).unwrap(), vec![1, 2, 3]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("run_7.txt")).unwrap(),
            "transcript"
        );
    }

    #[test]
    fn description_names_the_conditions() {
        assert_eq!(test_match(Side::B).to_string(), "vs rival on fortress as B");
    }
}
