//! Regeneration of repetitive source blocks.
//!
//! A source block is written once and expanded in every target block naming it, with its
//! variables replaced by the target's:
//!
//! ```text
//!     //$ +gen:source Walk dx dy
//!     x += dx; y += dy;
//!     //$ -gen:source
//!
//!     //$ +gen:target Walk 1 0
//!     x += 1; y += 0;
//!     //$ -gen:target
//! ```
//!
//! Lines between `//$ +gen:off` and `//$ -gen:off` in a source block are expanded as is.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::{bail, Context};
use regex::Regex;
use tracing::{debug, info};

static SOURCE_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*//\$\s+\+gen:source\s+(\S+)\s*(.*)$").unwrap());
static SOURCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*//\$\s+-gen:source(\s.*)?$").unwrap());
static TARGET_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*//\$\s+\+gen:target\s+(\S+)\s*(.*)$").unwrap());
static TARGET_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*//\$\s+-gen:target(\s.*)?$").unwrap());
static OFF_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*//\$\s+\+gen:off(\s.*)?$").unwrap());
static OFF_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*//\$\s+-gen:off(\s.*)?$").unwrap());

/// A block to expand, with the variables to substitute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBlock {
    pub vars: Vec<String>,
    pub lines: Vec<String>,
}

/// Source blocks by name.
pub type SourceBlocks = HashMap<String, SourceBlock>;

/// Adds the source blocks of `text` to `blocks`.
pub fn collect_sources(text: &str, blocks: &mut SourceBlocks) -> anyhow::Result<()> {
    let mut current: Option<(String, SourceBlock)> = None;
    for line in text.lines() {
        if let Some((name, block)) = current.as_mut() {
            if SOURCE_END.is_match(line) {
                blocks.insert(std::mem::take(name), std::mem::take(block));
                current = None;
            } else {
                block.lines.push(line.to_owned());
            }
            continue;
        }
        if let Some(caps) = SOURCE_START.captures(line) {
            let name = caps[1].to_owned();
            if blocks.contains_key(&name) {
                bail!("duplicate source block {name}");
            }
            let vars = caps[2].split_whitespace().map(str::to_owned).collect();
            current = Some((name, SourceBlock { vars, lines: vec![] }));
        }
    }
    if let Some((name, _)) = current {
        bail!("unclosed source block {name}");
    }
    Ok(())
}

fn substitute(block: &SourceBlock, targets: &[&str]) -> anyhow::Result<Vec<String>> {
    if block.vars.is_empty() {
        return Ok(block.lines.clone());
    }
    let pattern = block
        .vars
        .iter()
        .map(|var| format!("({})", regex::escape(var)))
        .collect::<Vec<_>>()
        .join("|");
    let regex = Regex::new(&pattern)?;
    let values: HashMap<&str, &str> = block
        .vars
        .iter()
        .map(String::as_str)
        .zip(targets.iter().copied())
        .collect();

    let mut disabled = false;
    let mut lines = Vec::with_capacity(block.lines.len());
    for line in &block.lines {
        if disabled {
            disabled = !OFF_END.is_match(line);
            lines.push(line.clone());
        } else if OFF_START.is_match(line) {
            disabled = true;
            lines.push(line.clone());
        } else {
            let replaced = regex.replace_all(line, |caps: &regex::Captures| {
                values.get(&caps[0]).copied().unwrap_or(&caps[0]).to_owned()
            });
            lines.push(replaced.into_owned());
        }
    }
    Ok(lines)
}

/// `text` with the body of every target block replaced by its expanded source block.
pub fn expand_targets(text: &str, blocks: &SourceBlocks) -> anyhow::Result<String> {
    let mut output: Vec<String> = vec![];
    let mut current: Option<String> = None;
    for line in text.lines() {
        if current.is_some() {
            // the old body is dropped
            if TARGET_END.is_match(line) {
                output.push(line.to_owned());
                current = None;
            }
            continue;
        }
        output.push(line.to_owned());
        let Some(caps) = TARGET_START.captures(line) else {
            continue;
        };
        let name = &caps[1];
        let Some(block) = blocks.get(name) else {
            bail!("missing source block {name}");
        };
        let targets: Vec<&str> = caps
            .get(2)
            .map_or("", |m| m.as_str())
            .split_whitespace()
            .collect();
        if targets.len() != block.vars.len() {
            bail!(
                "variable mismatch in target block {name}: source has [{}], target has [{}]",
                block.vars.join(" "),
                targets.join(" ")
            );
        }
        output.extend(substitute(block, &targets)?);
        current = Some(name.to_owned());
    }
    if let Some(name) = current {
        bail!("unclosed target block {name}");
    }
    let mut expanded = output.join("\n");
    if text.ends_with('\n') {
        expanded.push('\n');
    }
    Ok(expanded)
}

/// Regenerates the target blocks of `files` from their source blocks. Returns the files
/// that changed.
///
/// Nothing is written when a file is invalid.
pub fn regenerate<P: AsRef<Path>>(files: &[P]) -> anyhow::Result<Vec<PathBuf>> {
    let mut texts = Vec::with_capacity(files.len());
    let mut blocks = SourceBlocks::new();
    for file in files {
        let file = file.as_ref();
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("could not read {}", file.display()))?;
        collect_sources(&text, &mut blocks).with_context(|| format!("in {}", file.display()))?;
        texts.push((file, text));
    }
    debug!("{} source blocks", blocks.len());

    let mut updates = vec![];
    for (file, text) in &texts {
        let expanded =
            expand_targets(text, &blocks).with_context(|| format!("in {}", file.display()))?;
        if expanded != *text {
            updates.push((*file, expanded));
        }
    }
    let mut changed = Vec::with_capacity(updates.len());
    for (file, expanded) in updates {
        std::fs::write(file, expanded)
            .with_context(|| format!("could not write {}", file.display()))?;
        info!("regenerated {}", file.display());
        changed.push(file.to_path_buf());
    }
    Ok(changed)
}
