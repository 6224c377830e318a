//! Player checkouts and the simulation distribution they are registered with.
//!
//! A player is a directory of the player root laid out as `<name>/src/<name>/...`: the `src`
//! directory holds exactly one package, named after the player. The distribution engine finds
//! players through links in its `teams` directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tracing::{error, info, instrument, warn};
use walkdir::WalkDir;

use crate::{build_runner::TEMP_DIR_PREFIX, ids::ENVIRONMENT_PREFIX, transplant};

/// Installed simulation distribution.
#[derive(Debug, Clone)]
pub struct Dist {
    path: PathBuf,
}

impl Dist {
    pub fn new(path: impl Into<PathBuf>) -> Dist {
        Dist { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build descriptor template.
    pub fn build_file(&self) -> PathBuf {
        self.path.join("build.xml")
    }

    /// Base simulator configuration.
    pub fn conf_file(&self) -> PathBuf {
        self.path.join("bc.conf")
    }

    pub fn teams_dir(&self) -> PathBuf {
        self.path.join("teams")
    }

    fn team_link(&self, package: &Path) -> anyhow::Result<PathBuf> {
        let name = package
            .file_name()
            .with_context(|| format!("{} has no package name", package.display()))?;
        Ok(self.teams_dir().join(name))
    }

    /// Hooks a player package into the distribution.
    pub fn add_player(&self, package: &Path) -> anyhow::Result<()> {
        let link = self.team_link(package)?;
        std::fs::create_dir_all(self.teams_dir())
            .with_context(|| format!("could not create {}", self.teams_dir().display()))?;
        link_dir(package, &link)
            .with_context(|| format!("could not link {} to {}", link.display(), package.display()))
    }

    /// Unhooks a player package, leaving foreign entries of the `teams` directory alone.
    pub fn remove_player(&self, package: &Path) -> anyhow::Result<()> {
        let link = self.team_link(package)?;
        let Ok(metadata) = std::fs::symlink_metadata(&link) else {
            return Ok(());
        };
        if !metadata.file_type().is_symlink() || std::fs::read_link(&link)? != package {
            warn!("{} is not a link to {}, keeping it", link.display(), package.display());
            return Ok(());
        }
        remove_link(&link).with_context(|| format!("could not remove {}", link.display()))
    }
}

#[cfg(unix)]
fn link_dir(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(unix)]
fn remove_link(link: &Path) -> std::io::Result<()> {
    std::fs::remove_file(link)
}

#[cfg(windows)]
fn link_dir(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(original, link)
}

#[cfg(windows)]
fn remove_link(link: &Path) -> std::io::Result<()> {
    std::fs::remove_dir(link)
}

/// The single package directory inside `dir/src`.
///
/// Hidden entries (`.svn`, `.gitignore`...) are ignored. When `expected` is given, the package
/// must carry that name.
pub fn single_package(dir: &Path, expected: Option<&str>) -> anyhow::Result<PathBuf> {
    let source_dir = dir.join("src");
    if !source_dir.is_dir() {
        bail!("missing src directory in {}", dir.display());
    }
    let mut packages = vec![];
    for entry in std::fs::read_dir(&source_dir)
        .with_context(|| format!("could not read {}", source_dir.display()))?
    {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        packages.push(entry.path());
    }
    let [package] = packages.as_slice() else {
        bail!(
            "{} contains {} package directories instead of 1",
            source_dir.display(),
            packages.len()
        );
    };
    if !package.is_dir() {
        bail!("{} is not a directory", package.display());
    }
    if let Some(expected) = expected {
        if package.file_name().and_then(|n| n.to_str()) != Some(expected) {
            bail!("the package in {} is not named {expected}", source_dir.display());
        }
    }
    Ok(package.clone())
}

/// Directory holding every player checkout, plus the distribution they run in.
#[derive(Debug, Clone)]
pub struct Workspace {
    player_root: PathBuf,
    dist: Dist,
    temp_root: PathBuf,
}

impl Workspace {
    pub fn new(player_root: impl Into<PathBuf>, dist: Dist) -> Workspace {
        Workspace {
            player_root: player_root.into(),
            dist,
            temp_root: std::env::temp_dir(),
        }
    }

    /// Directory where match runs create their temporary directories.
    pub fn with_temp_root(mut self, path: impl Into<PathBuf>) -> Workspace {
        self.temp_root = path.into();
        self
    }

    pub fn dist(&self) -> &Dist {
        &self.dist
    }

    pub fn player_path(&self, name: &str) -> PathBuf {
        self.player_root.join(name)
    }

    /// Package directory of an installed player.
    pub fn package_path(&self, name: &str) -> anyhow::Result<PathBuf> {
        single_package(&self.player_path(name), Some(name))
    }

    /// Names of the players with a valid layout, sorted.
    pub fn players(&self) -> anyhow::Result<Vec<String>> {
        let mut names = vec![];
        for entry in std::fs::read_dir(&self.player_root)
            .with_context(|| format!("could not read {}", self.player_root.display()))?
        {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if entry.path().is_dir() && self.package_path(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn has_player(&self, name: &str) -> bool {
        self.package_path(name).is_ok()
    }

    /// Copies `source` into a new player called `name`, renames its package, and registers
    /// the copy with the distribution. Returns the new package directory.
    #[instrument(skip(self))]
    pub fn checkpoint(&self, source: &str, name: &str) -> anyhow::Result<PathBuf> {
        let source_dir = self.player_path(source);
        let source_package = self
            .package_path(source)
            .with_context(|| format!("'{source}' is not an installed player"))?;
        let destination = self.player_path(name);
        if destination.exists() {
            bail!("player already installed at {}", destination.display());
        }

        let copied = copy_player(&source_dir, &source_package, &destination, source, name)
            .and_then(|package| {
                self.dist.add_player(&package)?;
                Ok(package)
            });
        if copied.is_err() {
            let _ = std::fs::remove_dir_all(&destination);
        }
        let package = copied?;
        info!("checkpointed {source} into {name}");
        Ok(package)
    }

    /// Unregisters a player and deletes its checkout. Missing players are ignored.
    #[instrument(skip(self))]
    pub fn uninstall(&self, name: &str) -> anyhow::Result<()> {
        if let Ok(package) = self.package_path(name) {
            self.dist.remove_player(&package)?;
        }
        let dir = self.player_path(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("could not remove {}", dir.display()))?;
        }
        Ok(())
    }

    /// Removes what crashed runs left behind: generated players and temporary run
    /// directories. Returns the number of entries removed.
    pub fn cleanup(&self) -> anyhow::Result<usize> {
        let mut removed = 0;
        for player in self.players()? {
            if player.starts_with(ENVIRONMENT_PREFIX) {
                match self.uninstall(&player) {
                    Ok(()) => removed += 1,
                    Err(e) => error!("could not uninstall {player}: {e:#}"),
                }
            }
        }
        let Ok(entries) = std::fs::read_dir(&self.temp_root) else {
            return Ok(removed);
        };
        for entry in entries.flatten() {
            let stale = entry.file_name().to_string_lossy().starts_with(TEMP_DIR_PREFIX);
            if stale && entry.path().is_dir() && std::fs::remove_dir_all(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn copy_player(
    source_dir: &Path,
    source_package: &Path,
    destination: &Path,
    source: &str,
    name: &str,
) -> anyhow::Result<PathBuf> {
    let new_package = destination.join("src").join(name);
    let walker = WalkDir::new(source_dir).into_iter().filter_entry(|e| {
        let file_name = e.file_name().to_string_lossy();
        e.depth() == 0 || !(file_name.starts_with('.') || (e.depth() == 1 && file_name == "bin"))
    });
    for entry in walker {
        let entry = entry?;
        let target = match entry.path().strip_prefix(source_package) {
            Ok(rest) => new_package.join(rest),
            Err(_) => destination.join(entry.path().strip_prefix(source_dir)?),
        };
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("could not create {}", target.display()))?;
        } else if entry.path().extension().and_then(|e| e.to_str()) == Some("java") {
            let code = std::fs::read(entry.path())
                .with_context(|| format!("could not read {}", entry.path().display()))?;
            std::fs::write(&target, rename_package(code, source, name))
                .with_context(|| format!("could not write {}", target.display()))?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("could not copy {}", entry.path().display()))?;
        }
    }
    Ok(new_package)
}

/// Renames the package `from` in Java source. Sources that are not UTF-8 are read as
/// Latin-1, so their other bytes are kept as they are.
fn rename_package(code: Vec<u8>, from: &str, to: &str) -> Vec<u8> {
    match String::from_utf8(code) {
        Ok(code) => transplant::replace_identifier(&code, from, to, false).into_bytes(),
        Err(e) => {
            let code: String = e.into_bytes().into_iter().map(char::from).collect();
            transplant::replace_identifier(&code, from, to, false)
                .chars()
                .map(|c| c as u8)
                .collect()
        }
    }
}

#[cfg(test)]
mod workspace_tests {
    use super::*;

    fn install(root: &Path, name: &str) {
        let package = root.join(name).join("src").join(name);
        std::fs::create_dir_all(package.join("nav")).unwrap();
        std::fs::write(
            package.join("RobotPlayer.java"),
            format!("package {name};\nimport {name}.nav.Nav;\nclass RobotPlayer {{}}\n"),
        )
        .unwrap();
        std::fs::write(package.join("nav/Nav.java"), format!("package {name}.nav;\n")).unwrap();
    }

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("players")).unwrap();
        let ws = Workspace::new(dir.path().join("players"), Dist::new(dir.path().join("dist")))
            .with_temp_root(dir.path().join("tmp"));
        (dir, ws)
    }

    #[test]
    fn players_need_a_matching_package() {
        let (_dir, ws) = workspace();
        install(ws.player_root.as_path(), "alpha");
        install(ws.player_root.as_path(), "beta");
        std::fs::create_dir_all(ws.player_path("broken/src/other")).unwrap();
        std::fs::create_dir_all(ws.player_path("two/src/a")).unwrap();
        std::fs::create_dir_all(ws.player_path("two/src/b")).unwrap();
        std::fs::create_dir_all(ws.player_path("hidden/src/hidden")).unwrap();
        std::fs::create_dir_all(ws.player_path("hidden/src/.svn")).unwrap();

        assert_eq!(ws.players().unwrap(), vec!["alpha", "beta", "hidden"]);
        assert!(ws.has_player("alpha"));
        assert!(!ws.has_player("broken"));
        assert!(ws.package_path("two").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn checkpoint_renames_the_package() {
        let (dir, ws) = workspace();
        install(ws.player_root.as_path(), "alpha");
        std::fs::create_dir_all(ws.player_path("alpha/bin")).unwrap();
        std::fs::write(ws.player_path("alpha/bin/junk.class"), "x").unwrap();

        let package = ws.checkpoint("alpha", "bcpmtest_1_1").unwrap();
        assert_eq!(package, ws.player_path("bcpmtest_1_1/src/bcpmtest_1_1"));
        assert_eq!(
            std::fs::read_to_string(package.join("RobotPlayer.java")).unwrap(),
            "package bcpmtest_1_1;\nimport bcpmtest_1_1.nav.Nav;\nclass RobotPlayer {}\n"
        );
        assert!(!ws.player_path("bcpmtest_1_1/bin").exists());
        let link = ws.dist().teams_dir().join("bcpmtest_1_1");
        assert_eq!(std::fs::read_link(&link).unwrap(), package);

        assert!(ws.checkpoint("alpha", "bcpmtest_1_1").is_err());

        std::fs::create_dir_all(dir.path().join("tmp/bcpm_run_stale")).unwrap();
        assert_eq!(ws.cleanup().unwrap(), 2);
        assert!(!dir.path().join("tmp/bcpm_run_stale").exists());
        assert!(!ws.player_path("bcpmtest_1_1").exists());
        assert!(std::fs::symlink_metadata(&link).is_err());
        assert!(ws.has_player("alpha"));
    }

    #[cfg(unix)]
    #[test]
    fn checkpoint_keeps_latin1_sources() {
        let (_dir, ws) = workspace();
        install(ws.player_root.as_path(), "alpha");
        let strategy = ws.player_path("alpha/src/alpha/Strategy.java");
        std::fs::write(&strategy, b"package alpha;\n// caf\xe9\nclass Strategy {}\n").unwrap();

        let package = ws.checkpoint("alpha", "bcpmtest_1_3").unwrap();
        assert_eq!(
            std::fs::read(package.join("Strategy.java")).unwrap(),
            b"package bcpmtest_1_3;\n// caf\xe9\nclass Strategy {}\n"
        );
        ws.uninstall("bcpmtest_1_3").unwrap();
    }

    #[test]
    fn checkpoint_of_unknown_player_fails() {
        let (_dir, ws) = workspace();
        assert!(ws.checkpoint("ghost", "bcpmtest_1_2").is_err());
        assert!(!ws.player_path("bcpmtest_1_2").exists());
    }
}
