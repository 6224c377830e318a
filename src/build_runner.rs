//! Drives the external build tool that compiles players and runs the simulation engine.
//!
//! Every invocation gets a scratch directory holding a generated configuration file and a
//! build descriptor pointing at it:
//!
//! ```text
//! <tool> -buildfile <dir>/build.xml -logfile <dir>/<target>.log <target>
//! ```
//!
//! The scratch directory is removed when the invocation returns, whatever its outcome.

use std::{
    collections::BTreeMap,
    io::{BufRead, BufReader, ErrorKind},
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};

use anyhow::Context;
use tempfile::TempDir;
use tracing::{debug, error, info, instrument, warn};

use crate::{outcome::MATCH_FINISHED_MARKER, workspace::Dist};

/// Prefix of the scratch directories, so cleanup can find leftovers of crashed runs.
pub const TEMP_DIR_PREFIX: &str = "bcpm_run_";
/// Marker printed by the build tool when a target completed.
pub const BUILD_SUCCESSFUL: &str = "BUILD SUCCESSFUL";

/// Simulator options overriding the distribution's base configuration.
pub type Options = BTreeMap<String, String>;

/// Targets of the distribution's build descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTarget {
    /// Compiles the players.
    Build,
    /// Runs a match headless, writing the save file.
    File,
    /// Turns a save file into a text transcript.
    Transcribe,
    /// Runs a match in the live viewer.
    Run,
}

impl BuildTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildTarget::Build => "build",
            BuildTarget::File => "file",
            BuildTarget::Transcribe => "transcribe",
            BuildTarget::Run => "run",
        }
    }
}

/// Result of compiling a player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub success: bool,
    pub log: String,
}

/// Everything a simulation left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationOutput {
    /// Raw build tool log, engine lines included.
    pub log: String,
    /// Engine save file, replayable offline.
    pub replay: Vec<u8>,
    /// Text transcript of the save file.
    pub transcript: String,
}

/// The base configuration with every overridden key replaced.
///
/// Overridden keys are dropped from the base and appended in key order.
pub fn overlay_config(base: &str, overrides: &Options) -> String {
    let mut lines: Vec<String> = base
        .lines()
        .filter(|line| {
            let key = line.split_once('=').map_or(*line, |(key, _)| key);
            !overrides.contains_key(key)
        })
        .map(str::to_owned)
        .collect();
    lines.extend(overrides.iter().map(|(key, value)| format!("{key}={value}")));
    lines.join("\n") + "\n"
}

/// The distribution's build descriptor, rebased on the distribution and pointing at `conf`.
pub fn patch_build_descriptor(template: &str, dist: &Path, conf: &Path) -> String {
    let dist = dist.display().to_string();
    template
        .replace("basedir=\".\"", &format!("basedir=\"{dist}\""))
        .replace(
            "<property name=\"path.base\" location=\".\"",
            &format!("<property name=\"path.base\" location=\"{dist}\""),
        )
        .replace("bc.conf", &conf.display().to_string())
}

/// Runs build tool targets in throwaway directories.
#[derive(Debug, Clone)]
pub struct BuildRunner {
    tool: String,
    dist: Dist,
    temp_root: PathBuf,
}

impl BuildRunner {
    pub fn new(tool: impl Into<String>, dist: Dist, temp_root: impl Into<PathBuf>) -> BuildRunner {
        BuildRunner {
            tool: tool.into(),
            dist,
            temp_root: temp_root.into(),
        }
    }

    fn scratch_dir(&self) -> anyhow::Result<TempDir> {
        std::fs::create_dir_all(&self.temp_root)
            .with_context(|| format!("could not create {}", self.temp_root.display()))?;
        tempfile::Builder::new()
            .prefix(TEMP_DIR_PREFIX)
            .tempdir_in(&self.temp_root)
            .context("could not create scratch directory")
    }

    /// Writes the base configuration overlaid with `overrides` to `path`.
    pub fn write_config(&self, path: &Path, overrides: &Options) -> anyhow::Result<()> {
        let base_file = self.dist.conf_file();
        let base = std::fs::read_to_string(&base_file)
            .with_context(|| format!("could not read {}", base_file.display()))?;
        std::fs::write(path, overlay_config(&base, overrides))
            .with_context(|| format!("could not write {}", path.display()))
    }

    /// Writes a build descriptor that uses the configuration file `conf`.
    pub fn write_build(&self, path: &Path, conf: &Path) -> anyhow::Result<()> {
        let template_file = self.dist.build_file();
        let template = std::fs::read_to_string(&template_file)
            .with_context(|| format!("could not read {}", template_file.display()))?;
        std::fs::write(path, patch_build_descriptor(&template, self.dist.path(), conf))
            .with_context(|| format!("could not write {}", path.display()))
    }

    /// Prepares configuration and descriptor in `dir`, returning the descriptor.
    fn prepare(&self, dir: &Path, overrides: &Options) -> anyhow::Result<PathBuf> {
        let conf = dir.join("bc.conf");
        self.write_config(&conf, overrides)?;
        let build_file = dir.join("build.xml");
        self.write_build(&build_file, &conf)?;
        Ok(build_file)
    }

    fn invoke(
        &self,
        dir: &Path,
        build_file: &Path,
        log_file: &Path,
        target: BuildTarget,
    ) -> anyhow::Result<Output> {
        debug!("{} {} in {}", self.tool, target.as_str(), dir.display());
        let proc = Command::new(&self.tool)
            .arg("-buildfile")
            .arg(build_file)
            .arg("-logfile")
            .arg(log_file)
            .arg(target.as_str())
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("could not launch command '{}'", self.tool))?;
        proc.wait_with_output()
            .with_context(|| format!("failed to wait for end of '{}'", target.as_str()))
    }

    /// Runs `target` and returns its log, falling back on the direct output when the tool
    /// did not write the log file. Bytes that are not UTF-8 are replaced.
    fn run_target(
        &self,
        dir: &Path,
        build_file: &Path,
        target: BuildTarget,
    ) -> anyhow::Result<String> {
        let log_file = dir.join(format!("{}.log", target.as_str()));
        let output = self.invoke(dir, build_file, &log_file, target)?;
        match std::fs::read(&log_file) {
            Ok(log) => Ok(String::from_utf8_lossy(&log).into_owned()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("no log file for '{}', using its output", target.as_str());
                Ok(String::from_utf8_lossy(&output.stdout).into_owned()
                    + "\n"
                    + &String::from_utf8_lossy(&output.stderr))
            }
            Err(e) => Err(e).with_context(|| format!("could not read {}", log_file.display())),
        }
    }

    /// Compiles the player `player_name`. Success is read from the log, not the exit code.
    #[instrument(skip(self))]
    pub fn build(&self, player_name: &str) -> anyhow::Result<BuildOutcome> {
        let dir = self.scratch_dir()?;
        let overrides = Options::from([
            ("bc.game.team-a".to_owned(), player_name.to_owned()),
            ("bc.game.team-b".to_owned(), player_name.to_owned()),
        ]);
        let build_file = self.prepare(dir.path(), &overrides)?;
        let log = self.run_target(dir.path(), &build_file, BuildTarget::Build)?;
        let success = log.contains(BUILD_SUCCESSFUL);
        if success {
            info!("built {player_name}");
        } else {
            error!("build of {player_name} failed: {}", log.trim());
        }
        Ok(BuildOutcome { success, log })
    }

    /// Runs a match configured by `overrides`.
    ///
    /// Headless runs go through the `file` and `transcribe` targets. Live runs use the `run`
    /// target and return as soon as the engine reports the end of the match, leaving the
    /// viewer open.
    #[instrument(skip(self, overrides))]
    pub fn run_simulation(&self, overrides: &Options, live: bool) -> anyhow::Result<SimulationOutput> {
        let dir = self.scratch_dir()?;
        let save_file = dir.path().join("match.rms");
        let transcript_file = dir.path().join("match.txt");
        let mut options = overrides.clone();
        for (key, path) in [
            ("bc.server.save-file", &save_file),
            ("bc.server.transcribe-input", &save_file),
            ("bc.server.transcribe-output", &transcript_file),
        ] {
            options.insert(key.to_owned(), path.display().to_string());
        }
        let build_file = self.prepare(dir.path(), &options)?;

        let log = if live {
            self.run_live(dir.path(), &build_file)?
        } else {
            let log = self.run_target(dir.path(), &build_file, BuildTarget::File)?;
            self.run_target(dir.path(), &build_file, BuildTarget::Transcribe)?;
            log
        };

        let replay = std::fs::read(&save_file).unwrap_or_else(|_| {
            warn!("the engine did not write a save file");
            vec![]
        });
        let transcript = std::fs::read(&transcript_file)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        Ok(SimulationOutput {
            log,
            replay,
            transcript,
        })
    }

    fn run_live(&self, dir: &Path, build_file: &Path) -> anyhow::Result<String> {
        let mut child = Command::new(&self.tool)
            .arg("-buildfile")
            .arg(build_file)
            .arg(BuildTarget::Run.as_str())
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("could not launch command '{}'", self.tool))?;
        let stdout = child.stdout.take().context("no output pipe")?;
        let mut reader = BufReader::new(stdout);

        let mut log = String::new();
        let mut line = vec![];
        while reader.read_until(b'\n', &mut line)? > 0 {
            let text = String::from_utf8_lossy(&line);
            log.push_str(&text);
            let finished = text.contains(MATCH_FINISHED_MARKER);
            line.clear();
            if finished {
                break;
            }
        }
        std::fs::write(dir.join("run.log"), &log)?;

        // keep draining so the viewer never blocks on a full pipe
        std::thread::spawn(move || {
            let _ = std::io::copy(&mut reader, &mut std::io::sink());
            let _ = child.wait();
        });
        Ok(log)
    }
}

#[cfg(test)]
mod build_runner_tests {
    use super::*;

    #[test]
    fn overrides_replace_base_keys() {
        let base = "bc.engine.debug-methods=false\nbc.game.maps=old\nbc.game.team-a=x\n";
        let overrides = Options::from([
            ("bc.game.maps".to_owned(), "fortress".to_owned()),
            ("bc.engine.silence-b".to_owned(), "true".to_owned()),
        ]);
        assert_eq!(
            overlay_config(base, &overrides),
            "bc.engine.debug-methods=false\nbc.game.team-a=x\nbc.engine.silence-b=true\nbc.game.maps=fortress\n"
        );
    }

    #[test]
    fn descriptor_points_at_the_distribution() {
        let template = "<project basedir=\".\">\n<property name=\"path.base\" location=\".\" />\n<arg value=\"bc.conf\"/>";
        assert_eq!(
            patch_build_descriptor(template, Path::new("/opt/bc"), Path::new("/tmp/x/bc.conf")),
            "<project basedir=\"/opt/bc\">\n<property name=\"path.base\" location=\"/opt/bc\" />\n<arg value=\"/tmp/x/bc.conf\"/>"
        );
    }

    #[test]
    fn missing_distribution_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = BuildRunner::new("ant", Dist::new(dir.path().join("nope")), dir.path());
        assert!(runner.build("team000").is_err());
        // scratch directories are gone even on failure
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_DIR_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }
}
