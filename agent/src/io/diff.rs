//! Line-hunk patches with atomic application and derivable inverses.
//!
//! A [`Patch`] records the base content hash it was computed against;
//! applying it re-hashes the file on disk first, so concurrent external
//! modification surfaces as [`DiffError::Conflict`] with no write
//! performed. Writes land in a temporary file in the same directory and
//! are renamed into place, so a failure mid-write never leaves mixed
//! old/new content. Applying produces the exact inverse patch without
//! recomputation; `revert` is `apply` of that inverse.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffOp, capture_diff_slices};
use tracing::{debug, instrument};

use crate::core::fingerprint::content_hash;

/// A contiguous replacement of lines.
///
/// Lines are stored with their terminators so concatenation reconstructs
/// file content byte-exactly, including a missing final newline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    /// 0-based line index into the base content.
    pub old_start: usize,
    pub old_lines: Vec<String>,
    pub new_lines: Vec<String>,
}

/// A forward diff bound to the content hash it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub path: PathBuf,
    pub base_hash: String,
    pub hunks: Vec<Hunk>,
    #[serde(default)]
    pub applied: bool,
}

/// A patch that has been applied, together with its durable inverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPatch {
    pub patch: Patch,
    pub inverse: Patch,
}

/// One edit from the completion service: replace `old_len` lines starting
/// at `old_start` with `new_lines` (given without terminators).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEdit {
    pub old_start: usize,
    pub old_len: usize,
    pub new_lines: Vec<String>,
}

#[derive(Debug)]
pub enum DiffError {
    /// Base hash or hunk context no longer matches the file on disk.
    Conflict { path: PathBuf, detail: String },
    Io { path: PathBuf, source: std::io::Error },
}

impl fmt::Display for DiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffError::Conflict { path, detail } => {
                write!(f, "patch conflict on {}: {}", path.display(), detail)
            }
            DiffError::Io { path, source } => {
                write!(f, "patch io error on {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for DiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiffError::Conflict { .. } => None,
            DiffError::Io { source, .. } => Some(source),
        }
    }
}

/// Split content into lines keeping terminators, so `lines.concat()`
/// reproduces the input exactly.
fn split_lines(content: &str) -> Vec<&str> {
    content.split_inclusive('\n').collect()
}

/// Compute the patch transforming `old` into `new`.
pub fn compute(path: impl Into<PathBuf>, old: &str, new: &str) -> Patch {
    let old_lines = split_lines(old);
    let new_lines = split_lines(new);
    let ops = capture_diff_slices(Algorithm::Myers, &old_lines, &new_lines);

    let mut hunks = Vec::new();
    for op in &ops {
        let (old_range, new_range) = (op.old_range(), op.new_range());
        if matches!(op, &DiffOp::Equal { .. }) {
            continue;
        }
        hunks.push(Hunk {
            old_start: old_range.start,
            old_lines: old_lines[old_range].iter().map(|s| s.to_string()).collect(),
            new_lines: new_lines[new_range].iter().map(|s| s.to_string()).collect(),
        });
    }

    Patch {
        path: path.into(),
        base_hash: content_hash(old.as_bytes()),
        hunks,
        applied: false,
    }
}

/// Build a patch from completion-provided line edits against known base
/// content. Old lines are taken from the base itself (the completion only
/// names positions), so a fabricated range fails here rather than at apply.
pub fn from_line_edits(
    path: impl Into<PathBuf>,
    base: &str,
    edits: &[LineEdit],
) -> Result<Patch, DiffError> {
    let path = path.into();
    let base_lines = split_lines(base);
    let ends_without_newline = !base.is_empty() && !base.ends_with('\n');

    let mut hunks = Vec::with_capacity(edits.len());
    let mut last_end = 0usize;
    for edit in edits {
        let end = edit.old_start + edit.old_len;
        if edit.old_start < last_end {
            return Err(DiffError::Conflict {
                path,
                detail: format!("edits overlap at line {}", edit.old_start),
            });
        }
        if end > base_lines.len() {
            return Err(DiffError::Conflict {
                path,
                detail: format!(
                    "edit range {}..{} exceeds file length {}",
                    edit.old_start,
                    end,
                    base_lines.len()
                ),
            });
        }
        last_end = end;

        let replaces_tail = end == base_lines.len();
        let mut new_lines: Vec<String> = Vec::with_capacity(edit.new_lines.len());
        for (index, line) in edit.new_lines.iter().enumerate() {
            let is_last = index + 1 == edit.new_lines.len();
            if is_last && replaces_tail && ends_without_newline {
                new_lines.push(line.clone());
            } else {
                new_lines.push(format!("{line}\n"));
            }
        }

        hunks.push(Hunk {
            old_start: edit.old_start,
            old_lines: base_lines[edit.old_start..end]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            new_lines,
        });
    }

    Ok(Patch {
        path,
        base_hash: content_hash(base.as_bytes()),
        hunks,
        applied: false,
    })
}

impl Patch {
    /// True when the patch replaces every line of a non-trivial existing
    /// file; such rewrites are rejected by the apply pipeline.
    pub fn is_whole_file_rewrite(&self, total_old_lines: usize, threshold_lines: usize) -> bool {
        let replaced: usize = self.hunks.iter().map(|h| h.old_lines.len()).sum();
        replaced == total_old_lines && total_old_lines >= threshold_lines
    }
}

/// Apply a patch atomically, returning it with its durable inverse.
///
/// No bytes are written unless the base hash and every hunk context match
/// the file's current on-disk content.
#[instrument(skip_all, fields(path = %patch.path.display(), hunks = patch.hunks.len()))]
pub fn apply(root: &Path, patch: &Patch) -> Result<AppliedPatch, DiffError> {
    let full_path = root.join(&patch.path);
    let current = read_current(&full_path)?;

    let actual_hash = content_hash(current.as_bytes());
    if actual_hash != patch.base_hash {
        return Err(DiffError::Conflict {
            path: patch.path.clone(),
            detail: format!(
                "base hash mismatch (expected {}, found {})",
                short(&patch.base_hash),
                short(&actual_hash)
            ),
        });
    }

    let mut lines: Vec<String> = split_lines(&current).iter().map(|s| s.to_string()).collect();
    let mut inverse_hunks = Vec::with_capacity(patch.hunks.len());
    let mut offset = 0isize;

    for hunk in &patch.hunks {
        let start = hunk
            .old_start
            .checked_add_signed(offset)
            .ok_or_else(|| conflict(&patch.path, "hunk offset underflow"))?;
        let end = start + hunk.old_lines.len();
        if end > lines.len() {
            return Err(conflict(
                &patch.path,
                &format!("hunk at line {} exceeds file length", hunk.old_start),
            ));
        }
        if lines[start..end] != hunk.old_lines[..] {
            return Err(conflict(
                &patch.path,
                &format!("context mismatch at line {}", hunk.old_start),
            ));
        }
        lines.splice(start..end, hunk.new_lines.iter().cloned());
        inverse_hunks.push(Hunk {
            old_start: start,
            old_lines: hunk.new_lines.clone(),
            new_lines: hunk.old_lines.clone(),
        });
        offset += hunk.new_lines.len() as isize - hunk.old_lines.len() as isize;
    }

    let new_content = lines.concat();
    write_atomic(&full_path, &new_content).map_err(|source| DiffError::Io {
        path: patch.path.clone(),
        source,
    })?;
    debug!(bytes = new_content.len(), "patch applied");

    let mut applied = patch.clone();
    applied.applied = true;
    Ok(AppliedPatch {
        patch: applied,
        inverse: Patch {
            path: patch.path.clone(),
            base_hash: content_hash(new_content.as_bytes()),
            hunks: inverse_hunks,
            applied: false,
        },
    })
}

/// Restore the pre-patch content. Always derivable from an applied patch.
pub fn revert(root: &Path, applied: &AppliedPatch) -> Result<(), DiffError> {
    apply(root, &applied.inverse).map(|_| ())
}

fn read_current(full_path: &Path) -> Result<String, DiffError> {
    if !full_path.exists() {
        // Creation patch: base is empty content.
        return Ok(String::new());
    }
    fs::read_to_string(full_path).map_err(|source| DiffError::Io {
        path: full_path.to_path_buf(),
        source,
    })
}

fn conflict(path: &Path, detail: &str) -> DiffError {
    DiffError::Conflict {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

/// Write content to a temporary file in the same directory, then rename it
/// into place. Any failure before the rename leaves the original untouched.
fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "patch-target".to_string());
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)
}
