//! Config for the harness behaviors
//!
//! This module provides configuration options for controlling where players, the simulation
//! distribution and the test suite live, and how matches are scheduled.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! The following environment variables can be used to override configuration values. All
//! values are optional. Boolean flags are case-insensitive, set the value to `"true"` to enable.
//!
//! - `BCPM_VERBOSE`: Print match progress to stdout (default: `true`)
//! - `BCPM_LOG`: Enable logging to a file (default: `false`)
//! - `BCPM_LOG_DIR`: Directory receiving log files (default: current directory)
//! - `BCPM_WORKERS`: Number of simulation workers, or `auto` for one per CPU (default: `1`)
//! - `BCPM_PLAYER_ROOT`: Directory holding player checkouts (default: current directory)
//! - `BCPM_DIST_PATH`: Simulation distribution (default: `./battlecode`)
//! - `BCPM_TESTS_PATH`: Test suite checkout (default: `./tests`)
//! - `BCPM_TARGET_PLAYER`: Player package the suite is written against (default: `team000`)
//! - `BCPM_BUILD_TOOL`: Build tool driving the engine (default: `ant`)
//! - `BCPM_CACHE_DIR`: Where replays and transcripts of failed matches are kept
//!   (default: `<tmp>/bcpm`)
//! - `BCPM_TEMP_DIR`: Where builds and matches get their scratch directories
//!   (default: the system temporary directory)

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};

/// Configuration for harness behaviors.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) log_dir: PathBuf,
    pub(crate) workers: usize,
    pub(crate) player_root: PathBuf,
    pub(crate) dist_path: PathBuf,
    pub(crate) tests_path: PathBuf,
    pub(crate) target_player: String,
    pub(crate) build_tool: String,
    pub(crate) cache_dir: PathBuf,
    pub(crate) temp_dir: PathBuf,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Match progress is printed to stdout.
    /// - Logging to file is disabled.
    /// - Matches run on a single worker.
    /// - Players live in the current directory, the distribution in `./battlecode` and the
    ///   test suite in `./tests`.
    /// - The suite targets the `team000` player package.
    /// - The engine is driven through `ant`.
    pub fn new() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            verbose: true,
            log: false,
            log_dir: cwd.clone(),
            workers: 1,
            dist_path: cwd.join("battlecode"),
            tests_path: cwd.join("tests"),
            player_root: cwd,
            target_player: "team000".to_owned(),
            build_tool: "ant".to_owned(),
            cache_dir: std::env::temp_dir().join("bcpm"),
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// See the [module documentation](self) for the recognized variables. Unset variables keep
    /// their default value.
    ///
    /// # Errors
    /// Returned when `BCPM_WORKERS` is neither a positive integer nor `auto`.
    pub fn from_env() -> anyhow::Result<Self> {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        let mut config = Self::new();
        config.verbose = get_env_flag("BCPM_VERBOSE", config.verbose);
        config.log = get_env_flag("BCPM_LOG", config.log);
        if let Ok(workers) = std::env::var("BCPM_WORKERS") {
            config.workers = parse_workers(&workers)?;
        }
        if let Ok(path) = std::env::var("BCPM_LOG_DIR") {
            config.log_dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("BCPM_PLAYER_ROOT") {
            config.player_root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("BCPM_DIST_PATH") {
            config.dist_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("BCPM_TESTS_PATH") {
            config.tests_path = PathBuf::from(path);
        }
        if let Ok(name) = std::env::var("BCPM_TARGET_PLAYER") {
            config.target_player = name;
        }
        if let Ok(tool) = std::env::var("BCPM_BUILD_TOOL") {
            config.build_tool = tool;
        }
        if let Ok(path) = std::env::var("BCPM_CACHE_DIR") {
            config.cache_dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("BCPM_TEMP_DIR") {
            config.temp_dir = PathBuf::from(path);
        }
        Ok(config)
    }

    /// Enable or disable progress output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to a file inside `dir`.
    pub fn with_log(mut self, value: bool, dir: impl Into<PathBuf>) -> Self {
        self.log = value;
        self.log_dir = dir.into();
        self
    }

    /// Number of workers draining the match queue. Zero is bumped to one.
    pub fn with_workers(mut self, value: usize) -> Self {
        self.workers = value.max(1);
        self
    }

    /// Directory holding the player checkouts.
    pub fn with_player_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.player_root = path.into();
        self
    }

    /// Directory holding the simulation distribution (`build.xml`, `bc.conf`, `teams/`).
    pub fn with_dist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dist_path = path.into();
        self
    }

    /// Directory holding the test suite checkout.
    pub fn with_tests_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tests_path = path.into();
        self
    }

    /// Name of the player package the test suite is written against.
    pub fn with_target_player(mut self, name: impl Into<String>) -> Self {
        self.target_player = name.into();
        self
    }

    /// Executable used to build players and drive the engine.
    pub fn with_build_tool(mut self, tool: impl Into<String>) -> Self {
        self.build_tool = tool.into();
        self
    }

    /// Directory receiving replays and transcripts of failed matches.
    pub fn with_cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = path.into();
        self
    }

    /// Directory receiving the scratch directories of builds and matches.
    pub fn with_temp_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_dir = path.into();
        self
    }

    /// Number of simulation workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Directory holding the test suite checkout.
    pub fn tests_path(&self) -> &Path {
        &self.tests_path
    }

    /// Name of the player package the test suite is written against.
    pub fn target_player(&self) -> &str {
        &self.target_player
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_workers(value: &str) -> anyhow::Result<usize> {
    if value.trim().eq_ignore_ascii_case("auto") {
        return Ok(num_cpus::get().max(1));
    }
    let workers: usize = value
        .trim()
        .parse()
        .with_context(|| format!("invalid worker count '{value}'"))?;
    if workers == 0 {
        bail!("worker count must be at least 1");
    }
    Ok(workers)
}

#[cfg(test)]
mod configuration_tests {
    use super::*;

    #[test]
    fn defaults_to_a_single_worker() {
        let config = Configuration::new();
        assert_eq!(config.workers(), 1);
        assert_eq!(config.target_player(), "team000");
        assert_eq!(config.build_tool, "ant");
    }

    #[test]
    fn worker_count_parsing() {
        assert_eq!(parse_workers("4").unwrap(), 4);
        assert_eq!(parse_workers(" 2 ").unwrap(), 2);
        assert!(parse_workers("AUTO").unwrap() >= 1);
        assert!(parse_workers("0").is_err());
        assert!(parse_workers("many").is_err());
    }

    #[test]
    fn zero_workers_is_bumped() {
        assert_eq!(Configuration::new().with_workers(0).workers(), 1);
    }
}
