//! Artifact snapshots and patch validation for the healing loop.
//!
//! A [`Snapshot`] is a full copy of the suite directory taken before any
//! mutation. Restoring it reproduces the suite byte for byte, which is
//! checked against a SHA-256 fingerprint of the tree.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::models::{PatchOutcome, Suggestion};
use crate::errors::StageError;
use crate::util::strip_code_fences;

static PY_TEST_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:async[ \t]+)?def[ \t]+test\w*[ \t]*\(").unwrap());

static JS_TEST_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:test|it)(?:\.only)?[ \t]*\(").unwrap());

// ── Snapshots ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Snapshot {
    source: PathBuf,
    backup: PathBuf,
    fingerprint: String,
}

impl Snapshot {
    /// Copy `source` into `backup`, replacing any stale backup.
    pub fn capture(source: &Path, backup: &Path) -> Result<Self> {
        if backup.exists() {
            fs::remove_dir_all(backup)
                .with_context(|| format!("Failed to clear stale backup {}", backup.display()))?;
        }
        copy_tree(source, backup)?;
        let fingerprint = fingerprint_dir(source)?;
        Ok(Self {
            source: source.to_path_buf(),
            backup: backup.to_path_buf(),
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Replace the source tree with the backup and verify the result.
    pub fn restore(&self) -> Result<()> {
        if self.source.exists() {
            fs::remove_dir_all(&self.source)
                .with_context(|| format!("Failed to clear {}", self.source.display()))?;
        }
        copy_tree(&self.backup, &self.source)?;
        let restored = fingerprint_dir(&self.source)?;
        if restored != self.fingerprint {
            anyhow::bail!(
                "Restored tree {} does not match its snapshot",
                self.source.display()
            );
        }
        Ok(())
    }

    /// Drop the backup copy.
    pub fn discard(self) -> Result<()> {
        if self.backup.exists() {
            fs::remove_dir_all(&self.backup)
                .with_context(|| format!("Failed to remove backup {}", self.backup.display()))?;
        }
        Ok(())
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).with_context(|| format!("Failed to create {}", to.display()))?;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.context("Failed to walk artifact directory")?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .context("Walked path outside its root")?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("Failed to create {}", dest.display()))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// SHA-256 over every relative path and file body in the tree, in name order.
pub fn fingerprint_dir(dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.context("Failed to walk directory for fingerprint")?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .context("Walked path outside its root")?;
        hasher.update(rel.to_string_lossy().as_bytes());
        if entry.file_type().is_file() {
            let body = fs::read(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            hasher.update(b"\0f");
            hasher.update((body.len() as u64).to_le_bytes());
            hasher.update(&body);
        } else {
            hasher.update(b"\0d");
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn content_digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

// ── Validation ───────────────────────────────────────────────────────

fn invalid(target: &Path, reason: impl Into<String>) -> StageError {
    StageError::PatchInvalid {
        target: target.display().to_string(),
        reason: reason.into(),
    }
}

/// Resolve a suggestion target to an existing file inside `suite_dir`.
///
/// A bare file name also matches when the model prefixed it with a
/// directory the suite does not have (`tests/test_x.py`).
pub fn resolve_target(suite_dir: &Path, target: &Path) -> Result<PathBuf, StageError> {
    let escapes = target.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes || target.as_os_str().is_empty() {
        return Err(invalid(target, "target escapes the suite directory"));
    }

    let direct = suite_dir.join(target);
    if direct.is_file() {
        return Ok(direct);
    }
    if let Some(name) = target.file_name() {
        let by_name = suite_dir.join(name);
        if by_name.is_file() {
            return Ok(by_name);
        }
    }
    Err(invalid(target, "target artifact does not exist"))
}

/// Structural check shared by generated tests and healing patches: after
/// stripping code fences the source is non-empty, well formed, and defines
/// a test entry point. Returns the cleaned source.
pub fn check_test_source(content: &str) -> Result<String, String> {
    let cleaned = strip_code_fences(content);
    if cleaned.trim().is_empty() {
        return Err("source is empty".to_string());
    }
    check_well_formed(&cleaned)?;
    if !has_test_entry(&cleaned) {
        return Err("source has no test entry point".to_string());
    }
    Ok(cleaned)
}

/// Check a replacement and return the cleaned source to write.
pub fn validate_replacement(target: &Path, content: &str) -> Result<String, StageError> {
    check_test_source(content).map_err(|reason| invalid(target, reason))
}

pub fn has_test_entry(source: &str) -> bool {
    PY_TEST_ENTRY.is_match(source) || JS_TEST_ENTRY.is_match(source)
}

/// Lightweight well-formedness check: brackets balance outside string
/// literals and comments, and every string literal is closed.
pub fn check_well_formed(source: &str) -> Result<(), String> {
    let chars: Vec<char> = source.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => line += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '"' | '\'' | '`' => {
                let triple = c != '`'
                    && i + 2 < chars.len()
                    && chars[i + 1] == c
                    && chars[i + 2] == c;
                let start_line = line;
                i += if triple { 3 } else { 1 };
                let mut closed = false;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch == '\\' {
                        if chars.get(i + 1) == Some(&'\n') {
                            line += 1;
                        }
                        i += 2;
                        continue;
                    }
                    if ch == '\n' {
                        if !triple && c != '`' {
                            break;
                        }
                        line += 1;
                    }
                    if ch == c {
                        if !triple {
                            closed = true;
                            i += 1;
                            break;
                        }
                        if chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                            closed = true;
                            i += 3;
                            break;
                        }
                    }
                    i += 1;
                }
                if !closed {
                    return Err(format!("unterminated string literal on line {}", start_line));
                }
                continue;
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(format!(
                            "'{}' on line {} does not close '{}' from line {}",
                            c, line, open, open_line
                        ));
                    }
                    None => return Err(format!("unmatched '{}' on line {}", c, line)),
                }
            }
            _ => {}
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, open_line)) => Err(format!("'{}' opened on line {} is never closed", open, open_line)),
        None => Ok(()),
    }
}

// ── Apply ────────────────────────────────────────────────────────────

/// Validate and write `suggestion` into `suite_dir`, restoring `snapshot`
/// on any failure. The suite is byte-identical to the snapshot whenever
/// the outcome is not `Applied`.
pub fn apply_with_rollback(
    suite_dir: &Path,
    suggestion: &Suggestion,
    snapshot: &Snapshot,
) -> Result<PatchOutcome> {
    let prepared = resolve_target(suite_dir, &suggestion.target).and_then(|path| {
        validate_replacement(&suggestion.target, &suggestion.replacement).map(|src| (path, src))
    });

    match prepared {
        Ok((path, source)) => match fs::write(&path, source) {
            Ok(()) => Ok(PatchOutcome::Applied),
            Err(e) => {
                snapshot.restore()?;
                Ok(PatchOutcome::RolledBack {
                    reason: format!("failed to write {}: {}", path.display(), e),
                })
            }
        },
        Err(StageError::PatchInvalid { reason, .. }) => {
            snapshot.restore()?;
            Ok(PatchOutcome::Rejected { reason })
        }
        Err(other) => {
            snapshot.restore()?;
            Ok(PatchOutcome::Rejected {
                reason: other.to_string(),
            })
        }
    }
}
