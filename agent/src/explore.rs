//! Explore phase: rank candidate files and build the context bundle.
//!
//! Ranking order is fixed: file-name matches outrank tag/content matches,
//! which outrank directory-convention hints. All reads go through the tool
//! layer so they appear in the phase audit log.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::io::manifest::{FileEntry, RepoIndex};
use crate::io::tools::{ToolExecutor, ToolParams, ToolPayload};

/// Default number of files read into the bundle.
pub const DEFAULT_MAX_FILES: usize = 8;

/// One file's content captured for planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    pub path: PathBuf,
    pub content: String,
}

/// Context assembled by Explore and consumed by Plan/Apply.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub files: Vec<BundleFile>,
    /// Hashes of the selected files, the fingerprint's file component.
    pub file_hashes: BTreeMap<PathBuf, String>,
    /// Accumulated reviewer/verify feedback carried into the next Plan.
    pub feedback: Vec<String>,
}

impl ContextBundle {
    /// Render for prompt embedding: every file with a path header.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            out.push_str(&format!("--- {} ---\n{}\n", file.path.display(), file.content));
        }
        out
    }

}

/// No indexed file relates to the request; the pipeline short-circuits to a
/// clarifying question instead of planning blind.
#[derive(Debug)]
pub struct NoRelevantFiles {
    pub request: String,
}

impl fmt::Display for NoRelevantFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no files in the repository relate to \"{}\"",
            self.request
        )
    }
}

impl std::error::Error for NoRelevantFiles {}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "to", "in", "on", "of", "for", "and", "or", "with", "add", "fix", "make",
    "update", "change", "remove", "refactor", "implement", "write", "create", "module", "file",
    "function", "please", "it", "this", "that",
];

fn request_tokens(request: &str) -> Vec<String> {
    request
        .split(|ch: char| !ch.is_alphanumeric() && ch != '_' && ch != '.')
        .map(str::to_lowercase)
        .filter(|tok| tok.len() > 1 && !STOPWORDS.contains(&tok.as_str()))
        .collect()
}

/// Score one index entry against the request tokens.
///
/// Name match 3 points per token, path/tag match 2. Directory convention
/// (source/critical tags) adds 1 each, but only once a token matched:
/// convention alone does not make a file relevant.
fn score_entry(entry: &FileEntry, tokens: &[String]) -> u32 {
    let name = entry
        .path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let full_path = entry.path.to_string_lossy().to_lowercase();

    let mut token_score = 0;
    for token in tokens {
        let stem = token.trim_end_matches(".rs");
        if (!stem.is_empty() && name.contains(stem)) || name.contains(token.as_str()) {
            token_score += 3;
        } else if full_path.contains(token.as_str()) {
            token_score += 2;
        }
        if entry.tags.iter().any(|tag| tag == token) || entry.language == *token {
            token_score += 2;
        }
    }
    if token_score == 0 {
        return 0;
    }

    let mut convention = 0;
    if entry.tags.iter().any(|tag| tag == "critical") {
        convention += 1;
    }
    if entry.tags.iter().any(|tag| tag == "source") {
        convention += 1;
    }
    token_score + convention
}

/// Rank index entries for a request, best first. Entries without a token
/// match are excluded entirely.
pub fn rank_candidates<'a>(index: &'a RepoIndex, request: &str) -> Vec<(&'a FileEntry, u32)> {
    let tokens = request_tokens(request);
    let mut scored: Vec<(&FileEntry, u32)> = index
        .entries
        .iter()
        .map(|entry| (entry, score_entry(entry, &tokens)))
        .filter(|(_, score)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.path.cmp(&b.0.path)));
    scored
}

/// Build the context bundle for a request.
#[instrument(skip_all, fields(max_files))]
pub fn explore(
    request: &str,
    index: &RepoIndex,
    tools: &mut ToolExecutor,
    max_files: usize,
) -> Result<ContextBundle> {
    let ranked = rank_candidates(index, request);
    if ranked.is_empty() {
        return Err(anyhow!(NoRelevantFiles {
            request: request.to_string(),
        }));
    }

    let mut bundle = ContextBundle::default();
    for (entry, score) in ranked.iter().take(max_files) {
        debug!(path = %entry.path.display(), score, "reading candidate");
        let payload = tools.execute(&ToolParams::ReadFile {
            path: entry.path.clone(),
        })?;
        let ToolPayload::FileContents { path, content } = payload else {
            continue;
        };
        bundle
            .file_hashes
            .insert(path.clone(), entry.content_hash.clone());
        bundle.files.push(BundleFile { path, content });
    }
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::manifest::{build_index, detect_manifest};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    fn seeded_repo() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("Cargo.toml"), "[package]\nname = \"x\"\n").expect("write");
        fs::write(temp.path().join("src/parser.rs"), "pub fn parse() {}\n").expect("write");
        fs::write(temp.path().join("src/render.rs"), "pub fn render() {}\n").expect("write");
        fs::write(temp.path().join("README.md"), "docs\n").expect("write");
        temp
    }

    fn tools(root: &Path) -> ToolExecutor {
        ToolExecutor::new(root, Duration::from_secs(5), 10_000, vec!["target".to_string()])
    }

    #[test]
    fn name_match_ranks_first() {
        let temp = seeded_repo();
        let manifest = detect_manifest(temp.path());
        let index = build_index(temp.path(), &manifest).expect("index");

        let ranked = rank_candidates(&index, "fix the parser");
        assert!(!ranked.is_empty());
        assert_eq!(ranked[0].0.path, PathBuf::from("src/parser.rs"));
    }

    #[test]
    fn unrelated_request_yields_no_candidates() {
        let temp = seeded_repo();
        let manifest = detect_manifest(temp.path());
        let index = build_index(temp.path(), &manifest).expect("index");

        let ranked = rank_candidates(&index, "quantum flux capacitor");
        assert!(ranked.is_empty());
    }

    #[test]
    fn explore_reads_contents_and_hashes() {
        let temp = seeded_repo();
        let manifest = detect_manifest(temp.path());
        let index = build_index(temp.path(), &manifest).expect("index");
        let mut tools = tools(temp.path());

        let bundle = explore("fix the parser", &index, &mut tools, 4).expect("bundle");
        assert!(
            bundle
                .files
                .iter()
                .any(|f| f.path == PathBuf::from("src/parser.rs"))
        );
        assert!(bundle.file_hashes.contains_key(Path::new("src/parser.rs")));
        assert!(!tools.drain_log().is_empty());
    }

    #[test]
    fn explore_errors_with_no_relevant_files() {
        let temp = seeded_repo();
        let manifest = detect_manifest(temp.path());
        let index = build_index(temp.path(), &manifest).expect("index");
        let mut tools = tools(temp.path());

        let err = explore("quantum flux capacitor", &index, &mut tools, 4).expect_err("empty");
        assert!(err.downcast_ref::<NoRelevantFiles>().is_some());
    }

    #[test]
    fn bundle_render_includes_path_headers() {
        let bundle = ContextBundle {
            files: vec![BundleFile {
                path: PathBuf::from("src/a.rs"),
                content: "fn a() {}\n".to_string(),
            }],
            file_hashes: BTreeMap::new(),
            feedback: Vec::new(),
        };
        let rendered = bundle.render();
        assert!(rendered.contains("--- src/a.rs ---"));
        assert!(rendered.contains("fn a() {}"));
    }
}
