//! Drives the harness against a fake build tool: a shell script that honours
//! `-buildfile <file> -logfile <file> <target>` and answers like the engine, always letting
//! team A win.
#![cfg(unix)]

use std::{
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    time::{Duration, Instant},
};

use bcpm::prelude::*;

const FAKE_TOOL: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    -buildfile) build="$2"; shift 2 ;;
    -logfile) log="$2"; shift 2 ;;
    *) target="$1"; shift ;;
  esac
done
conf="$(dirname "$build")/bc.conf"
get() { grep "^$1=" "$conf" | cut -d= -f2-; }
case "$target" in
  build)
    team=$(get bc.game.team-a)
    # scratch directories live in <root>/tmp, players in <root>/players
    players="$(dirname "$conf")/../../players"
    if grep -rq "BROKEN" "$players/$team/src" 2>/dev/null; then
      echo "BUILD FAILED" > "$log"
    else
      echo "BUILD SUCCESSFUL" > "$log"
    fi
    ;;
  file)
    printf 'replay of %s' "$(get bc.game.maps)" > "$(get bc.server.save-file)"
    {
      echo "Buildfile: $build"
      echo "     [java] [server] $(get bc.game.team-a) vs. $(get bc.game.team-b) on $(get bc.game.maps)"
      echo "     [java] [A:SOLDIER#1@3]hello from A"
      if [ "$(get bc.game.maps)" = "cafe" ]; then
        printf '     [java] [A:SOLDIER#1@4]caf\351\n'
      fi
      echo "     [java] [server] $(get bc.game.team-a) (A) wins"
      echo "     [java] [server] Reason: The winning team destroyed the enemy base."
      echo "     [java] - Match Finished -"
      echo "     [java] ignored"
      echo "BUILD SUCCESSFUL"
    } > "$log"
    ;;
  run)
    echo "     [java] [server] $(get bc.game.team-a) vs. $(get bc.game.team-b) on $(get bc.game.maps)"
    echo "     [java] [server] $(get bc.game.team-a) (A) wins"
    echo "     [java] [server] Reason: The winning team destroyed the enemy base."
    echo "     [java] - Match Finished -"
    # the viewer stays open
    sleep 10
    ;;
  transcribe)
    echo "transcript" > "$(get bc.server.transcribe-output)"
    echo "BUILD SUCCESSFUL" > "$log"
    ;;
esac
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let tool = root.join("fake-ant");
        std::fs::write(&tool, FAKE_TOOL).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dist = root.join("dist");
        std::fs::create_dir_all(&dist).unwrap();
        std::fs::write(dist.join("build.xml"), "<project basedir=\".\"><arg value=\"bc.conf\"/></project>\n").unwrap();
        std::fs::write(dist.join("bc.conf"), "bc.engine.debug-methods=false\nbc.game.maps=default\n").unwrap();
        std::fs::create_dir_all(root.join("players")).unwrap();
        std::fs::create_dir_all(root.join("tmp")).unwrap();

        Fixture { _dir: dir, root }
    }

    fn install(&self, name: &str, strategy: &str) {
        let package = self.root.join("players").join(name).join("src").join(name);
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(
            package.join("RobotPlayer.java"),
            format!("package {name};\nclass RobotPlayer {{ Strategy s; }}\n"),
        )
        .unwrap();
        std::fs::write(
            package.join("Strategy.java"),
            format!("package {name};\nclass Strategy {{ {strategy} }}\n"),
        )
        .unwrap();
    }

    fn install_suite(&self) {
        let package = self.root.join("suite").join("src").join("tests");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(
            package.join("Quiet.java"),
            "package tests;\nimport team000.RobotPlayer;\nclass Quiet { }\n",
        )
        .unwrap();
        std::fs::write(
            package.join("Broken.java"),
            "package tests;\nclass Broken { BROKEN }\n",
        )
        .unwrap();
    }

    fn harness(&self) -> Harness {
        let config = Configuration::new()
            .with_verbose(false)
            .with_player_root(self.root.join("players"))
            .with_dist_path(self.root.join("dist"))
            .with_tests_path(self.root.join("suite"))
            .with_build_tool(self.root.join("fake-ant").display().to_string())
            .with_cache_dir(self.root.join("cache"))
            .with_temp_dir(self.root.join("tmp"));
        Harness::new(config).unwrap()
    }

    fn leftovers(&self) -> Vec<String> {
        let mut names = vec![];
        for dir in ["players", "tmp", "dist/teams"] {
            let Ok(entries) = std::fs::read_dir(self.root.join(dir)) else {
                continue;
            };
            names.extend(
                entries
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|name| name.starts_with("bcpm")),
            );
        }
        names
    }
}

#[test]
fn one_off_match_returns_the_engine_log() {
    let fixture = Fixture::new();
    fixture.install("alpha", "");
    fixture.install("beta", "");
    let harness = fixture.harness();

    let log = harness.run_match("alpha", "beta", "fortress", false).unwrap();
    assert!(log.starts_with("[server] alpha vs. beta on fortress"));
    assert!(log.ends_with("- Match Finished -"));
    assert!(!log.contains("ignored"));

    assert!(harness.run_match("alpha", "ghost", "fortress", false).is_err());
}

#[test]
fn engine_log_survives_bytes_that_are_not_utf8() {
    let fixture = Fixture::new();
    fixture.install("alpha", "");
    fixture.install("beta", "");
    let harness = fixture.harness();

    let log = harness.run_match("alpha", "beta", "cafe", false).unwrap();
    assert!(log.contains("[A:SOLDIER#1@4]caf\u{FFFD}"));
    assert!(log.contains("[server] alpha (A) wins"));
    assert!(log.ends_with("- Match Finished -"));
}

#[test]
fn live_match_returns_when_the_match_ends() {
    let fixture = Fixture::new();
    fixture.install("alpha", "");
    fixture.install("beta", "");
    let harness = fixture.harness();

    let started = Instant::now();
    let log = harness.run_match("alpha", "beta", "fortress", true).unwrap();
    assert!(started.elapsed() < Duration::from_secs(8));
    assert!(log.starts_with("[server] alpha vs. beta on fortress"));
    assert!(log.contains("[server] alpha (A) wins"));
    assert!(log.ends_with("- Match Finished -"));
}

#[test]
fn duel_plays_both_sides() {
    let fixture = Fixture::new();
    fixture.install("alpha", "");
    fixture.install("beta", "");
    let harness = fixture.harness();
    let maps = vec!["fortress".to_owned(), "lanes".to_owned()];

    let result = harness.duel("alpha", "beta", &maps).unwrap();
    // the fake engine always lets team A win
    assert_eq!((result.wins, result.losses, result.ties), (2, 2, 0));
    assert_eq!(result.score, 0);
    assert!(result.won.iter().all(|m| m.side() == Side::A));
    assert!(fixture.leftovers().is_empty());

    assert!(harness.duel("alpha", "ghost", &maps).is_err());
}

#[test]
fn failed_build_aborts_the_duel() {
    let fixture = Fixture::new();
    fixture.install("alpha", "BROKEN");
    fixture.install("beta", "");
    let harness = fixture.harness();

    let error = harness.duel("alpha", "beta", &["fortress".to_owned()]).unwrap_err();
    assert!(error.to_string().contains("could not build alpha"));
    assert!(fixture.leftovers().is_empty());
}

#[test]
fn suite_runs_in_transplanted_environments() {
    let fixture = Fixture::new();
    fixture.install("alpha", "");
    fixture.install("beta", "");
    fixture.install_suite();
    let harness = fixture.harness();

    let mut builder = harness.suite_builder();
    builder.map("fortress").vs("beta");
    builder.add_class("team000.Quiet", "tests.Quiet");
    builder
        .match_with(|m| {
            m.it("wins", |t| should_win(t));
            m.it("wins by destruction", |t| should_win_by(t, "destroyed"));
            m.it("does not throw", |t| should_not_throw(t));
        })
        .unwrap();
    builder.side(Side::B);
    builder
        .match_with(|m| {
            m.it("wins as B", |t| should_win(t));
        })
        .unwrap();
    builder.replace_class("team000.Strategy", "tests.Broken");
    builder
        .match_with(|m| {
            m.it("never runs", |t| should_win(t));
        })
        .unwrap();
    let suite = builder.build();
    assert_eq!(suite.environments().len(), 2);

    let report = harness.run_suite(&suite, "alpha").unwrap();
    assert_eq!(report.total, 5);
    assert_eq!(report.passed, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(report.skipped, 1);

    let failure = &report.failures[0];
    assert_eq!(failure.description, "vs beta on fortress as B wins as B");
    let replay = failure
        .stash
        .lines()
        .find_map(|line| line.strip_prefix("Replay:"))
        .map(|path| PathBuf::from(path.trim()))
        .unwrap();
    assert!(replay.is_file());
    assert_eq!(std::fs::read_to_string(replay).unwrap(), "replay of fortress");
    assert!(fixture.leftovers().is_empty());
}

#[test]
fn cleanup_removes_generated_players() {
    let fixture = Fixture::new();
    fixture.install("alpha", "");
    fixture.install("bcpmtest_1_1", "");
    std::fs::create_dir_all(fixture.root.join("tmp/bcpm_run_crashed")).unwrap();
    let harness = fixture.harness();

    assert_eq!(harness.cleanup().unwrap(), 2);
    assert!(fixture.leftovers().is_empty());
    assert!(harness.workspace().has_player("alpha"));
}
