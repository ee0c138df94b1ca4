//! Repository manifest and file index.
//!
//! The manifest (`agent.toml`) declares project kind, verification command,
//! critical paths, and naming conventions. It is read at pipeline start and
//! never written by the pipeline itself; `agent init` can generate one by
//! auto-detection. The file index is derived from the working tree and
//! rebuilt lazily when the tree hash changes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::core::fingerprint::content_hash;

pub const MANIFEST_FILE: &str = "agent.toml";
const INDEX_FILE: &str = ".agent/state/index.json";

/// Parsed `agent.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Manifest {
    pub project: ProjectMeta,
    pub verify: VerifyConfig,
    pub paths: PathsConfig,
    pub conventions: Conventions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ProjectMeta {
    pub name: String,
    /// Project kind, e.g. "rust", "python", "javascript", "go".
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Command run by the Verify phase (tests/lint).
    pub command: Vec<String>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: vec!["true".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Files always worth reading for context.
    pub critical: Vec<PathBuf>,
    /// Directory names excluded from the index.
    pub ignore: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            critical: Vec::new(),
            ignore: default_ignore(),
        }
    }
}

fn default_ignore() -> Vec<String> {
    ["target", "node_modules", "venv", ".venv", "__pycache__", "dist", "build"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Conventions {
    pub source_dirs: Vec<String>,
    pub test_dirs: Vec<String>,
}

impl Default for Conventions {
    fn default() -> Self {
        Self {
            source_dirs: vec!["src".to_string(), "lib".to_string()],
            test_dirs: vec!["tests".to_string(), "test".to_string()],
        }
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            project: ProjectMeta::default(),
            verify: VerifyConfig::default(),
            paths: PathsConfig::default(),
            conventions: Conventions::default(),
        }
    }
}

impl Manifest {
    pub fn validate(&self) -> Result<()> {
        if self.verify.command.is_empty() || self.verify.command[0].trim().is_empty() {
            return Err(anyhow!("verify.command must be a non-empty array"));
        }
        for path in &self.paths.critical {
            crate::core::plan::validate_relative(path)
                .map_err(|err| anyhow!("paths.critical {err}"))?;
        }
        Ok(())
    }
}

/// Load the manifest from `<root>/agent.toml`.
///
/// A missing manifest is an error: the pipeline refuses to guess a
/// verification command (run `agent init` first).
pub fn load_manifest(root: &Path) -> Result<Manifest> {
    let path = root.join(MANIFEST_FILE);
    if !path.exists() {
        return Err(anyhow!(
            "missing {} (run `agent init` to generate one)",
            path.display()
        ));
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let manifest: Manifest =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    manifest.validate()?;
    Ok(manifest)
}

/// Write a manifest (used by `agent init` only; the pipeline never writes it).
pub fn write_manifest(root: &Path, manifest: &Manifest) -> Result<()> {
    manifest.validate()?;
    let path = root.join(MANIFEST_FILE);
    let mut buf = toml::to_string_pretty(manifest).context("serialize manifest")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Detect project kind and verification command from well-known files.
pub fn detect_manifest(root: &Path) -> Manifest {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let (kind, command, critical) = if root.join("Cargo.toml").exists() {
        ("rust", vec!["cargo", "test"], vec!["Cargo.toml", "src/lib.rs", "src/main.rs"])
    } else if root.join("package.json").exists() {
        ("javascript", vec!["npm", "test"], vec!["package.json"])
    } else if root.join("go.mod").exists() {
        ("go", vec!["go", "test", "./..."], vec!["go.mod"])
    } else if root.join("pyproject.toml").exists() || root.join("requirements.txt").exists() {
        ("python", vec!["python", "-m", "pytest"], vec!["pyproject.toml"])
    } else {
        ("unknown", vec!["true"], Vec::new())
    };

    Manifest {
        project: ProjectMeta {
            name,
            kind: kind.to_string(),
        },
        verify: VerifyConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
        },
        paths: PathsConfig {
            critical: critical
                .iter()
                .map(PathBuf::from)
                .filter(|p| root.join(p).exists())
                .collect(),
            ignore: default_ignore(),
        },
        conventions: Conventions::default(),
    }
}

/// One indexed file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub language: String,
    pub tags: Vec<String>,
    pub content_hash: String,
}

/// Indexed view of the working tree, keyed by its tree hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoIndex {
    pub tree_hash: String,
    pub entries: Vec<FileEntry>,
}

impl RepoIndex {
    pub fn entry(&self, path: &Path) -> Option<&FileEntry> {
        self.entries.iter().find(|entry| entry.path == path)
    }

    pub fn hashes_for(&self, paths: &[PathBuf]) -> BTreeMap<PathBuf, String> {
        self.entries
            .iter()
            .filter(|entry| paths.contains(&entry.path))
            .map(|entry| (entry.path.clone(), entry.content_hash.clone()))
            .collect()
    }
}

/// Load the cached index if its tree hash still matches, else rebuild and
/// persist. This is the only operation that refreshes the index.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn load_or_rebuild_index(root: &Path, manifest: &Manifest) -> Result<RepoIndex> {
    let fresh = build_index(root, manifest)?;
    let cache_path = root.join(INDEX_FILE);

    if cache_path.exists() {
        let contents = fs::read_to_string(&cache_path)
            .with_context(|| format!("read {}", cache_path.display()))?;
        if let Ok(cached) = serde_json::from_str::<RepoIndex>(&contents)
            && cached.tree_hash == fresh.tree_hash
        {
            debug!(tree_hash = %short(&cached.tree_hash), "index cache hit");
            return Ok(cached);
        }
        debug!("index cache stale, rebuilding");
    }

    let mut buf = serde_json::to_string_pretty(&fresh).context("serialize index")?;
    buf.push('\n');
    if let Some(parent) = cache_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&cache_path, buf).with_context(|| format!("write {}", cache_path.display()))?;
    Ok(fresh)
}

/// Scan the working tree into an index.
pub fn build_index(root: &Path, manifest: &Manifest) -> Result<RepoIndex> {
    let mut entries = Vec::new();
    scan_dir(root, root, manifest, &mut entries)?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for entry in &entries {
        hasher.update(entry.path.to_string_lossy().as_bytes());
        hasher.update(b"=");
        hasher.update(entry.content_hash.as_bytes());
        hasher.update(b"\n");
    }
    Ok(RepoIndex {
        tree_hash: hex::encode(hasher.finalize()),
        entries,
    })
}

fn scan_dir(
    root: &Path,
    dir: &Path,
    manifest: &Manifest,
    entries: &mut Vec<FileEntry>,
) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.context("read dir entry")?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if path.is_dir() {
            if name.starts_with('.') || manifest.paths.ignore.contains(&name) {
                continue;
            }
            scan_dir(root, &path, manifest, entries)?;
            continue;
        }
        if name.starts_with('.') {
            continue;
        }

        let rel = path
            .strip_prefix(root)
            .context("strip repository root prefix")?
            .to_path_buf();
        let metadata = entry.metadata().context("file metadata")?;
        let contents = fs::read(&path).with_context(|| format!("read {}", path.display()))?;

        entries.push(FileEntry {
            language: language_for(&rel),
            tags: tags_for(&rel, manifest),
            size: metadata.len(),
            content_hash: content_hash(&contents),
            path: rel,
        });
    }
    Ok(())
}

fn language_for(path: &Path) -> String {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" => "javascript",
        "ts" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "sh" => "shell",
        "toml" | "yaml" | "yml" | "json" => "config",
        "md" => "markdown",
        _ => "text",
    }
    .to_string()
}

fn tags_for(path: &Path, manifest: &Manifest) -> Vec<String> {
    let mut tags = Vec::new();
    if let Some(first) = path.iter().next() {
        let first = first.to_string_lossy().to_string();
        if manifest.conventions.source_dirs.contains(&first) {
            tags.push("source".to_string());
        }
        if manifest.conventions.test_dirs.contains(&first) {
            tags.push("test".to_string());
        }
    }
    if manifest.paths.critical.iter().any(|c| c == path) {
        tags.push("critical".to_string());
    }
    tags
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_repo() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("Cargo.toml"), "[package]\nname = \"x\"\n").expect("write");
        fs::write(temp.path().join("src/lib.rs"), "pub fn x() {}\n").expect("write");
        temp
    }

    #[test]
    fn detects_rust_project() {
        let temp = seeded_repo();
        let manifest = detect_manifest(temp.path());
        assert_eq!(manifest.project.kind, "rust");
        assert_eq!(manifest.verify.command, vec!["cargo", "test"]);
        assert!(manifest.paths.critical.contains(&PathBuf::from("src/lib.rs")));
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_manifest(temp.path()).expect_err("missing");
        assert!(err.to_string().contains("agent init"));
    }

    #[test]
    fn manifest_round_trips() {
        let temp = seeded_repo();
        let manifest = detect_manifest(temp.path());
        write_manifest(temp.path(), &manifest).expect("write");
        let loaded = load_manifest(temp.path()).expect("load");
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn index_tracks_files_and_tags() {
        let temp = seeded_repo();
        let manifest = detect_manifest(temp.path());
        let index = build_index(temp.path(), &manifest).expect("index");

        let lib = index.entry(Path::new("src/lib.rs")).expect("lib entry");
        assert_eq!(lib.language, "rust");
        assert!(lib.tags.contains(&"source".to_string()));
        assert!(lib.tags.contains(&"critical".to_string()));
    }

    #[test]
    fn tree_hash_changes_when_content_changes() {
        let temp = seeded_repo();
        let manifest = detect_manifest(temp.path());
        let before = build_index(temp.path(), &manifest).expect("index");

        fs::write(temp.path().join("src/lib.rs"), "pub fn y() {}\n").expect("write");
        let after = build_index(temp.path(), &manifest).expect("index");
        assert_ne!(before.tree_hash, after.tree_hash);
    }

    #[test]
    fn cached_index_is_reused_when_tree_unchanged() {
        let temp = seeded_repo();
        let manifest = detect_manifest(temp.path());
        let first = load_or_rebuild_index(temp.path(), &manifest).expect("first");
        // The cache file itself lives under .agent/ which the scan skips.
        let second = load_or_rebuild_index(temp.path(), &manifest).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn ignored_directories_are_skipped() {
        let temp = seeded_repo();
        fs::create_dir_all(temp.path().join("target")).expect("mkdir");
        fs::write(temp.path().join("target/out.rs"), "x").expect("write");
        let manifest = detect_manifest(temp.path());
        let index = build_index(temp.path(), &manifest).expect("index");
        assert!(index.entry(Path::new("target/out.rs")).is_none());
    }
}
