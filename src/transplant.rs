//! Text level code transplantation between a test suite and a player environment.
//!
//! Operations never parse the source code. Identifiers are renamed by plain substitution,
//! assuming they are delimited by characters that cannot be part of an identifier, and call
//! stubbing works one line at a time. The [`SourceRewriter`] trait is the seam where a real
//! parser could be plugged in later.
//!
//! Player source can steer the rewriting with line directives:
//!
//! ```text
//! //$ +mark:label      opens the fragment named `label`
//! //$ -mark:label      closes it
//! //$ -stubs           disables call stubbing for the following lines of the file
//! //$ +stubs           enables it again (default)
//! ```

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::{bail, Context};
use regex::{Captures, Regex};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

static DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*//\$(.*)$").unwrap());
static MARK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*//\$\s*([+-])mark:(\S+)\s*$").unwrap());
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// A pending change to an environment's source tree.
#[derive(Debug, Clone)]
pub enum TransplantOp {
    /// Writes the suite class `source` over the player class `target`.
    CopyFile { target: String, source: String },
    /// Replaces the regions labeled `target_label` in `target` with the region labeled
    /// `source_label` in `source`.
    CopyFragment {
        target: String,
        target_label: String,
        source: String,
        source_label: String,
    },
    /// Redirects calls to a method towards a static method.
    Stub(StubCall),
}

impl TransplantOp {
    /// Stub operations patch every file of the tree instead of writing a single one.
    pub fn is_patch(&self) -> bool {
        matches!(self, TransplantOp::Stub(_))
    }
}

/// Rewrites `receiver.method(args)` into `target(receiver, args)`.
#[derive(Debug, Clone)]
pub struct StubCall {
    method: String,
    target: String,
    pattern: Regex,
}

impl StubCall {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> anyhow::Result<StubCall> {
        let method = method.into();
        if !IDENTIFIER.is_match(&method) {
            bail!("cannot stub '{method}': not a method name");
        }
        let pattern = Regex::new(&format!(r"([A-Za-z0-9_.]+)\.{}\(", regex::escape(&method)))?;
        Ok(StubCall {
            method,
            target: target.into(),
            pattern,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn with_target(&self, target: String) -> StubCall {
        StubCall {
            target,
            ..self.clone()
        }
    }

    fn rewrite_line(&self, line: &str) -> String {
        self.pattern
            .replace_all(line, |caps: &Captures| {
                let receiver = &caps[1];
                // already stubbed: `Stubs.move(` where the target is `Stubs.move`
                if format!("{receiver}.{}", self.method) == self.target {
                    caps[0].to_owned()
                } else {
                    format!("{}({receiver},", self.target)
                }
            })
            .into_owned()
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Replaces whole-identifier occurrences of `from` with `to`.
///
/// An occurrence preceded by `.` is only replaced when `allow_dot_before` is set, so renaming
/// the package `a` leaves `x.a` alone while renaming the class `A` still rewrites `pkg.A`.
pub fn replace_identifier(text: &str, from: &str, to: &str, allow_dot_before: bool) -> String {
    if from.is_empty() || from == to {
        return text.to_owned();
    }
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, _) in text.match_indices(from) {
        let end = start + from.len();
        let before_ok = match start.checked_sub(1).map(|i| bytes[i]) {
            None => true,
            Some(b'.') => allow_dot_before,
            Some(b) => !is_ident_byte(b),
        };
        let after_ok = bytes.get(end).map_or(true, |&b| !is_ident_byte(b));
        if before_ok && after_ok {
            out.push_str(&text[last..start]);
            out.push_str(to);
            last = end;
        }
    }
    out.push_str(&text[last..]);
    out
}

#[derive(Debug, Clone)]
struct Rename {
    from: String,
    to: String,
    allow_dot_before: bool,
}

/// Ordered identifier substitutions applied to transplanted code.
#[derive(Debug, Clone, Default)]
pub struct Renames {
    rules: Vec<Rename>,
}

impl Renames {
    pub fn new() -> Renames {
        Renames::default()
    }

    /// Renames a package. Identical names are ignored.
    pub fn package(mut self, from: &str, to: &str) -> Renames {
        if from != to {
            self.rules.push(Rename {
                from: from.to_owned(),
                to: to.to_owned(),
                allow_dot_before: false,
            });
        }
        self
    }

    /// Renames a class, qualified uses included. Identical names are ignored.
    pub fn class(mut self, from: &str, to: &str) -> Renames {
        if from != to {
            self.rules.push(Rename {
                from: from.to_owned(),
                to: to.to_owned(),
                allow_dot_before: true,
            });
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn apply(&self, text: &str) -> String {
        self.rules.iter().fold(text.to_owned(), |acu, rule| {
            replace_identifier(&acu, &rule.from, &rule.to, rule.allow_dot_before)
        })
    }
}

/// The three rewriting primitives the harness needs.
pub trait SourceRewriter: Send + Sync {
    /// Content of a whole file copied under new names.
    fn copy(&self, source: &str, renames: &Renames) -> String;

    /// `destination` with every `target_label` region holding the `source_label` fragment of
    /// `source`.
    ///
    /// `None` when either label is missing, in which case nothing must be written.
    fn inject_fragment(
        &self,
        source: &str,
        source_label: &str,
        destination: &str,
        target_label: &str,
        renames: &Renames,
    ) -> Option<String>;

    /// `file` with every enabled line going through the stubs.
    fn stub_calls(&self, file: &str, stubs: &[StubCall]) -> String;
}

/// Line based implementation of [`SourceRewriter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TextRewriter;

fn mark(line: &str) -> Option<(bool, &str)> {
    let caps = MARK.captures(line)?;
    let open = &caps[1] == "+";
    Some((open, caps.get(2)?.as_str()))
}

/// Lines strictly between the `+mark:label` and `-mark:label` directives.
pub fn extract_fragment(text: &str, label: &str) -> Option<String> {
    let mut body: Option<Vec<&str>> = None;
    for line in text.split('\n') {
        let marker = mark(line).filter(|(_, l)| *l == label).map(|(open, _)| open);
        if let Some(lines) = body.as_mut() {
            if marker == Some(false) {
                return Some(lines.join("\n"));
            }
            lines.push(line);
        } else if marker == Some(true) {
            body = Some(vec![]);
        }
    }
    None
}

impl SourceRewriter for TextRewriter {
    fn copy(&self, source: &str, renames: &Renames) -> String {
        renames.apply(source)
    }

    fn inject_fragment(
        &self,
        source: &str,
        source_label: &str,
        destination: &str,
        target_label: &str,
        renames: &Renames,
    ) -> Option<String> {
        let fragment = renames.apply(&extract_fragment(source, source_label)?);

        let mut out = vec![];
        let mut injected = false;
        let mut lines = destination.split('\n');
        while let Some(line) = lines.next() {
            out.push(line.to_owned());
            if !matches!(mark(line), Some((true, l)) if l == target_label) {
                continue;
            }
            // skip the old body, keep the closing marker
            let close = lines.find(|l| matches!(mark(l), Some((false, l)) if l == target_label))?;
            out.push(fragment.clone());
            out.push(close.to_owned());
            injected = true;
        }
        injected.then(|| out.join("\n"))
    }

    fn stub_calls(&self, file: &str, stubs: &[StubCall]) -> String {
        let mut enabled = true;
        file.split('\n')
            .map(|line| {
                if let Some(caps) = DIRECTIVE.captures(line) {
                    match caps[1].trim().to_lowercase().as_str() {
                        "+stubs" => enabled = true,
                        "-stubs" => enabled = false,
                        _ => {}
                    }
                    return line.to_owned();
                }
                if !enabled {
                    return line.to_owned();
                }
                stubs
                    .iter()
                    .fold(line.to_owned(), |acu, stub| stub.rewrite_line(&acu))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Path to the `.java` file of a fully qualified class, in the source root holding
/// `package_path`.
pub fn java_path(package_path: &Path, class_name: &str) -> PathBuf {
    let root = package_path.parent().unwrap_or_else(|| Path::new(""));
    root.join(format!("{}.java", class_name.replace('.', "/")))
}

/// Package of a fully qualified class name, empty for the default package.
pub fn java_package(class_name: &str) -> &str {
    class_name.rsplit_once('.').map_or("", |(pkg, _)| pkg)
}

/// Short name of a fully qualified class name.
pub fn java_class(class_name: &str) -> &str {
    class_name
        .rsplit_once('.')
        .map_or(class_name, |(_, class)| class)
}

/// Applies transplant operations from a test suite tree to a player tree.
pub struct Transplant<'a> {
    suite_package: &'a Path,
    player_package: &'a Path,
    target_player: &'a str,
    player_name: &'a str,
    rewriter: &'a dyn SourceRewriter,
}

impl<'a> Transplant<'a> {
    /// `suite_package` and `player_package` are the package directories (`src/<package>`);
    /// code written against `target_player` is redirected to `player_name`.
    pub fn new(
        suite_package: &'a Path,
        player_package: &'a Path,
        target_player: &'a str,
        player_name: &'a str,
        rewriter: &'a dyn SourceRewriter,
    ) -> Transplant<'a> {
        Transplant {
            suite_package,
            player_package,
            target_player,
            player_name,
            rewriter,
        }
    }

    /// Moves a name from the target player's package to the environment's package.
    pub fn retarget(&self, name: &str) -> String {
        match name.strip_prefix(self.target_player) {
            Some(rest) if rest.starts_with('.') => format!("{}{rest}", self.player_name),
            _ => name.to_owned(),
        }
    }

    /// Code copied within one package is left alone, references to the target player
    /// included.
    fn renames(&self, source: &str, target: &str) -> Renames {
        let (source_package, target_package) = (java_package(source), java_package(target));
        let renames = Renames::new().package(source_package, target_package);
        let renames = if source_package != target_package {
            renames.package(self.target_player, self.player_name)
        } else {
            renames
        };
        renames.class(java_class(source), java_class(target))
    }

    /// Applies a copy operation. Returns whether a file was written.
    ///
    /// Missing sources, missing labels and missing destination directories skip the
    /// operation.
    #[instrument(skip(self))]
    pub fn apply_file_op(&self, op: &TransplantOp) -> anyhow::Result<bool> {
        match op {
            TransplantOp::CopyFile { target, source } => {
                let target = self.retarget(target);
                let source_file = java_path(self.suite_package, source);
                if !source_file.is_file() {
                    warn!("source class {source} not found at {}", source_file.display());
                    return Ok(false);
                }
                let contents = std::fs::read_to_string(&source_file)
                    .with_context(|| format!("could not read {}", source_file.display()))?;
                let contents = self.rewriter.copy(&contents, &self.renames(source, &target));

                let destination = java_path(self.player_package, &target);
                if !destination.parent().is_some_and(Path::is_dir) {
                    warn!("no package directory for {target}");
                    return Ok(false);
                }
                std::fs::write(&destination, contents)
                    .with_context(|| format!("could not write {}", destination.display()))?;
                debug!("copied {source} to {target}");
                Ok(true)
            }
            TransplantOp::CopyFragment {
                target,
                target_label,
                source,
                source_label,
            } => {
                let target = self.retarget(target);
                let source_file = java_path(self.suite_package, source);
                let destination = java_path(self.player_package, &target);
                if !source_file.is_file() || !destination.is_file() {
                    warn!("fragment copy {source}:{source_label} -> {target}:{target_label} has a missing file");
                    return Ok(false);
                }
                let source_text = std::fs::read_to_string(&source_file)
                    .with_context(|| format!("could not read {}", source_file.display()))?;
                let old = std::fs::read_to_string(&destination)
                    .with_context(|| format!("could not read {}", destination.display()))?;
                let Some(new) = self.rewriter.inject_fragment(
                    &source_text,
                    source_label,
                    &old,
                    target_label,
                    &self.renames(source, &target),
                ) else {
                    debug!("label {source_label} or {target_label} not found, skipping");
                    return Ok(false);
                };
                if new != old {
                    std::fs::write(&destination, new)
                        .with_context(|| format!("could not write {}", destination.display()))?;
                }
                Ok(true)
            }
            TransplantOp::Stub(_) => bail!("stub operations patch the whole tree"),
        }
    }

    /// Runs the stubs over every `.java` file of the player tree. Returns the number of files
    /// that changed.
    #[instrument(skip_all, fields(player = self.player_name))]
    pub fn apply_patch_ops(&self, stubs: &[StubCall]) -> anyhow::Result<usize> {
        if stubs.is_empty() {
            return Ok(0);
        }
        let stubs: Vec<StubCall> = stubs
            .iter()
            .map(|stub| stub.with_target(self.retarget(stub.target())))
            .collect();

        let mut changed = 0;
        for entry in WalkDir::new(self.player_package) {
            let entry = entry?;
            if !entry.file_type().is_file()
                || entry.path().extension().and_then(|e| e.to_str()) != Some("java")
            {
                continue;
            }
            let old = std::fs::read_to_string(entry.path())
                .with_context(|| format!("could not read {}", entry.path().display()))?;
            let new = self.rewriter.stub_calls(&old, &stubs);
            if new != old {
                std::fs::write(entry.path(), new)
                    .with_context(|| format!("could not write {}", entry.path().display()))?;
                changed += 1;
            }
        }
        info!("stubbed calls in {changed} files");
        Ok(changed)
    }
}

#[cfg(test)]
mod transplant_tests {
    use super::*;

    #[test]
    fn identifier_boundaries() {
        let text = "package team000;\nimport team000.util.X;\nteam0001 a.team000 team000_x";
        assert_eq!(
            replace_identifier(text, "team000", "env_1", false),
            "package env_1;\nimport env_1.util.X;\nteam0001 a.team000 team000_x"
        );
        assert_eq!(
            replace_identifier("new Foo(); pkg.Foo f; FooBar", "Foo", "Bar", true),
            "new Bar(); pkg.Bar f; FooBar"
        );
        assert_eq!(replace_identifier("Foo Foo", "Foo", "Foo", true), "Foo Foo");
    }

    #[test]
    fn adjacent_occurrences_are_all_renamed() {
        assert_eq!(replace_identifier("A A,A", "A", "B", true), "B B,B");
    }

    #[test]
    fn java_names() {
        assert_eq!(java_package("team000.util.Nav"), "team000.util");
        assert_eq!(java_class("team000.util.Nav"), "Nav");
        assert_eq!(java_package("Nav"), "");
        assert_eq!(java_class("Nav"), "Nav");
        assert_eq!(
            java_path(Path::new("/w/p/src/p"), "p.util.Nav"),
            PathBuf::from("/w/p/src/p/util/Nav.java")
        );
    }

    const SOURCE: &str = "class S {\n  //$ +mark:attack\n  rc.attack(target);\n  rc.yield();\n  //$ -mark:attack\n}";

    #[test]
    fn fragments_are_extracted() {
        assert_eq!(
            extract_fragment(SOURCE, "attack").as_deref(),
            Some("  rc.attack(target);\n  rc.yield();")
        );
        assert_eq!(extract_fragment(SOURCE, "defend"), None);
        assert_eq!(extract_fragment("//$ +mark:open\nbody", "open"), None);
    }

    #[test]
    fn fragments_are_injected_between_markers() {
        let destination = "void run() {\n    //$ +mark:strike\n    old();\n    //$ -mark:strike\n}\n";
        let out = TextRewriter
            .inject_fragment(SOURCE, "attack", destination, "strike", &Renames::new())
            .unwrap();
        assert_eq!(
            out,
            "void run() {\n    //$ +mark:strike\n  rc.attack(target);\n  rc.yield();\n    //$ -mark:strike\n}\n"
        );
        // injecting again keeps the same result
        let again = TextRewriter
            .inject_fragment(SOURCE, "attack", &out, "strike", &Renames::new())
            .unwrap();
        assert_eq!(again, out);
    }

    #[test]
    fn missing_destination_marker_is_a_noop() {
        let destination = "void run() {}\n";
        assert_eq!(
            TextRewriter.inject_fragment(SOURCE, "attack", destination, "strike", &Renames::new()),
            None
        );
    }

    fn stubs() -> Vec<StubCall> {
        vec![StubCall::new("senseNearby", "team000.Stubs.senseNearby").unwrap()]
    }

    #[test]
    fn calls_are_stubbed() {
        let out = TextRewriter.stub_calls("Robot[] r = this.rc.senseNearby(range);", &stubs());
        assert_eq!(out, "Robot[] r = team000.Stubs.senseNearby(this.rc,range);");
    }

    #[test]
    fn nested_calls_are_stubbed() {
        let out = TextRewriter.stub_calls("a.senseNearby(b.senseNearby(1))", &stubs());
        assert_eq!(
            out,
            "team000.Stubs.senseNearby(a,team000.Stubs.senseNearby(b,1))"
        );
    }

    #[test]
    fn directives_toggle_stubbing() {
        let file = "rc.senseNearby(1);\n  //$ -STUBS \nrc.senseNearby(2);\n//$ +stubs\nrc.senseNearby(3);";
        let out = TextRewriter.stub_calls(file, &stubs());
        assert_eq!(
            out,
            "team000.Stubs.senseNearby(rc,1);\n  //$ -STUBS \nrc.senseNearby(2);\n//$ +stubs\nteam000.Stubs.senseNearby(rc,3);"
        );
    }

    #[test]
    fn two_stub_passes_do_not_double_wrap() {
        let file = "rc.senseNearby(1);\n//$ -stubs\nrc.senseNearby(2);\n";
        let once = TextRewriter.stub_calls(file, &stubs());
        let twice = TextRewriter.stub_calls(&once, &stubs());
        assert_eq!(once, twice);
        assert!(twice.contains("\nrc.senseNearby(2);\n"));
    }

    #[test]
    fn other_methods_are_left_alone() {
        let out = TextRewriter.stub_calls("rc.senseNearbyRobots(1); x.remove(2);", &stubs());
        assert_eq!(out, "rc.senseNearbyRobots(1); x.remove(2);");
    }

    #[test]
    fn stub_needs_a_method_name() {
        assert!(StubCall::new("a.b", "X.y").is_err());
        assert!(StubCall::new("", "X.y").is_err());
    }

    fn suite_tree() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let suite = dir.path().join("suite/src/tests");
        let player = dir.path().join("env/src/bcpmtest_1");
        std::fs::create_dir_all(&suite).unwrap();
        std::fs::create_dir_all(&player).unwrap();
        (dir, suite, player)
    }

    #[test]
    fn copy_with_identical_names_is_verbatim() {
        let (_dir, suite, player) = suite_tree();
        let body = "package bcpmtest_1;\n\nimport team000.Util;\nclass Nav { Nav() {} }\n";
        std::fs::create_dir_all(suite.parent().unwrap().join("bcpmtest_1")).unwrap();
        std::fs::write(java_path(&suite, "bcpmtest_1.Nav"), body).unwrap();
        let transplant = Transplant::new(&suite, &player, "team000", "bcpmtest_1", &TextRewriter);
        let op = TransplantOp::CopyFile {
            target: "bcpmtest_1.Nav".to_owned(),
            source: "bcpmtest_1.Nav".to_owned(),
        };
        assert!(transplant.apply_file_op(&op).unwrap());
        assert_eq!(
            std::fs::read_to_string(java_path(&player, "bcpmtest_1.Nav")).unwrap(),
            body
        );
    }

    #[test]
    fn copy_renames_package_and_class() {
        let (_dir, suite, player) = suite_tree();
        std::fs::write(
            java_path(&suite, "tests.FakeNav"),
            "package tests;\nimport team000.Util;\nclass FakeNav { FakeNav() { tests.FakeNav.x(); } }\n",
        )
        .unwrap();
        let transplant = Transplant::new(&suite, &player, "team000", "bcpmtest_1", &TextRewriter);
        let op = TransplantOp::CopyFile {
            target: "team000.Nav".to_owned(),
            source: "tests.FakeNav".to_owned(),
        };
        assert!(transplant.apply_file_op(&op).unwrap());
        assert_eq!(
            std::fs::read_to_string(player.join("Nav.java")).unwrap(),
            "package bcpmtest_1;\nimport bcpmtest_1.Util;\nclass Nav { Nav() { bcpmtest_1.Nav.x(); } }\n"
        );
    }

    #[test]
    fn copy_into_missing_package_is_skipped() {
        let (_dir, suite, player) = suite_tree();
        std::fs::write(java_path(&suite, "tests.A"), "class A {}").unwrap();
        let transplant = Transplant::new(&suite, &player, "team000", "bcpmtest_1", &TextRewriter);
        let op = TransplantOp::CopyFile {
            target: "team000.nowhere.A".to_owned(),
            source: "tests.A".to_owned(),
        };
        assert!(!transplant.apply_file_op(&op).unwrap());
        assert!(!player.join("nowhere").exists());
    }

    #[test]
    fn patch_ops_walk_the_tree() {
        let (_dir, suite, player) = suite_tree();
        std::fs::create_dir_all(player.join("nav")).unwrap();
        std::fs::write(player.join("nav/Nav.java"), "rc.senseNearby(1);").unwrap();
        std::fs::write(player.join("Plain.java"), "int x = 1;").unwrap();
        std::fs::write(player.join("notes.txt"), "rc.senseNearby(1);").unwrap();
        let transplant = Transplant::new(&suite, &player, "team000", "bcpmtest_1", &TextRewriter);
        assert_eq!(transplant.apply_patch_ops(&stubs()).unwrap(), 1);
        assert_eq!(
            std::fs::read_to_string(player.join("nav/Nav.java")).unwrap(),
            "bcpmtest_1.Stubs.senseNearby(rc,1);"
        );
        assert_eq!(
            std::fs::read_to_string(player.join("notes.txt")).unwrap(),
            "rc.senseNearby(1);"
        );
        // second pass finds nothing left to rewrite
        assert_eq!(transplant.apply_patch_ops(&stubs()).unwrap(), 0);
    }
}
