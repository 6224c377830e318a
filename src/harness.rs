//! Entry point tying the workspace, the build tool and the scheduler together.

use std::sync::Arc;

use anyhow::bail;
use tracing::{error, info, instrument};

use crate::{
    build_runner::{BuildRunner, Options},
    configuration::Configuration,
    environment::{Environment, SetupContext},
    ids::IdAllocator,
    logger::init_logger,
    outcome,
    scheduler::{self, DuelPhase, DuelResult, SimulationExecutor},
    suite::{Suite, SuiteReport, SuiteTree, SuiteBuilder},
    transplant::TextRewriter,
    workspace::{Dist, Workspace},
};

/// Runs matches, duels and test suites against the players of a workspace.
pub struct Harness {
    config: Configuration,
    workspace: Workspace,
    runner: BuildRunner,
    ids: IdAllocator,
    rewriter: TextRewriter,
}

impl Harness {
    /// Wires the harness described by `config`, and starts file logging when it is enabled.
    ///
    /// # Errors
    /// Returned when the log file cannot be set up.
    pub fn new(config: Configuration) -> anyhow::Result<Harness> {
        if config.log {
            init_logger(&config.log_dir)?;
        }
        let dist = Dist::new(&config.dist_path);
        let workspace = Workspace::new(&config.player_root, dist.clone())
            .with_temp_root(&config.temp_dir);
        let runner = BuildRunner::new(&config.build_tool, dist, &config.temp_dir);
        info!(?config, "harness ready");
        Ok(Harness {
            config,
            workspace,
            runner,
            ids: IdAllocator::new(),
            rewriter: TextRewriter,
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    /// Test suite checkout described by the configuration.
    pub fn suite_tree(&self) -> SuiteTree {
        SuiteTree::new(&self.config.tests_path, &self.config.target_player)
    }

    /// A builder whose environments are named by this harness.
    pub fn suite_builder(&self) -> SuiteBuilder<'_> {
        SuiteBuilder::new(&self.ids)
    }

    fn setup_context<'a>(&'a self, suite: Option<&'a SuiteTree>) -> SetupContext<'a> {
        SetupContext {
            workspace: &self.workspace,
            runner: &self.runner,
            suite,
            rewriter: &self.rewriter,
        }
    }

    fn check_players(&self, players: &[&str]) -> anyhow::Result<()> {
        for player in players {
            if !self.workspace.has_player(player) {
                bail!("player {player} is not installed in {}", self.config.player_root.display());
            }
        }
        Ok(())
    }

    /// Plays one match between two installed players and returns the engine log.
    #[instrument(skip(self))]
    pub fn run_match(&self, player_a: &str, player_b: &str, map: &str, live: bool) -> anyhow::Result<String> {
        self.check_players(&[player_a, player_b])?;
        let overrides = Options::from([
            ("bc.dialog.skip".to_owned(), "true".to_owned()),
            ("bc.game.maps".to_owned(), map.to_owned()),
            ("bc.game.team-a".to_owned(), player_a.to_owned()),
            ("bc.game.team-b".to_owned(), player_b.to_owned()),
        ]);
        let output = self.runner.run_simulation(&overrides, live)?;
        Ok(outcome::extract_engine_log(&output.log))
    }

    /// Plays `player` against `opponent` on every map, from both sides.
    ///
    /// `player` is built once into a private environment shared by all the matches.
    #[instrument(skip(self))]
    pub fn duel(&self, player: &str, opponent: &str, maps: &[String]) -> anyhow::Result<DuelResult> {
        let mut phase = DuelPhase::Idle;
        let mut enter = |next: DuelPhase| {
            info!(from = %phase, to = %next, "duel");
            phase = next;
        };

        enter(DuelPhase::Validating);
        self.check_players(&[player, opponent])?;

        enter(DuelPhase::Building);
        let environment = Arc::new(Environment::new(self.ids.next_environment_name()));
        if !environment.setup(&self.setup_context(None), player) {
            bail!("could not build {player}:\n{}", environment.build_log());
        }

        enter(DuelPhase::Scheduling);
        let matches = scheduler::schedule_duel(&environment, opponent, maps);

        enter(DuelPhase::Draining);
        let executor = SimulationExecutor::new(&self.runner, &self.ids);
        let verbose = self.config.verbose;
        let drained = scheduler::drain(matches, self.config.workers, &executor, |m| {
            if verbose {
                scheduler::print_duel_progress(m);
            }
        });
        if let Err(e) = environment.teardown(&self.workspace) {
            error!("could not remove {}: {e:#}", environment.name());
        }

        enter(DuelPhase::Aggregating);
        let result = scheduler::aggregate(drained?);
        info!(score = result.score, wins = result.wins, losses = result.losses, ties = result.ties);

        enter(DuelPhase::Done);
        Ok(result)
    }

    /// Sets up the environments of `suite` from `player`, runs it and tears everything down.
    #[instrument(skip(self, suite))]
    pub fn run_suite(&self, suite: &Suite, player: &str) -> anyhow::Result<SuiteReport> {
        self.check_players(&[player])?;
        let tree = self.suite_tree();
        let ctx = self.setup_context(Some(&tree));
        for environment in suite.environments() {
            environment.setup(&ctx, player);
        }

        let executor = SimulationExecutor::new(&self.runner, &self.ids);
        let report = suite.run(
            &executor,
            self.config.workers,
            &self.config.cache_dir,
            self.config.verbose,
        );

        for environment in suite.environments() {
            if let Err(e) = environment.teardown(&self.workspace) {
                error!("could not remove {}: {e:#}", environment.name());
            }
        }
        report
    }

    /// Removes players and scratch directories left by crashed runs.
    pub fn cleanup(&self) -> anyhow::Result<usize> {
        let removed = self.workspace.cleanup()?;
        info!("cleanup removed {removed} entries");
        Ok(removed)
    }
}
