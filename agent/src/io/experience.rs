//! Experience cache: fingerprint → prior outcome store.
//!
//! Entries persist across process restarts in a keyed JSON map. A hit is
//! only returned while its TTL holds and every referenced file hash still
//! matches the working tree; stale entries are dropped eagerly. The store
//! serializes its own load-modify-write cycle behind a mutex; callers
//! never touch the file directly.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::fingerprint::content_hash;
use crate::core::plan::Plan;

/// Outcome associated with a cached fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachedOutcome {
    Success,
    Failure,
}

/// One cached pipeline outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceEntry {
    pub fingerprint: String,
    pub plan: Plan,
    pub outcome: CachedOutcome,
    /// Hashes of the files the fingerprint covered, re-checked on lookup.
    pub file_hashes: BTreeMap<PathBuf, String>,
    pub recorded_at_epoch_secs: u64,
    pub ttl_secs: u64,
}

impl ExperienceEntry {
    fn expired(&self, now_epoch_secs: u64) -> bool {
        now_epoch_secs.saturating_sub(self.recorded_at_epoch_secs) > self.ttl_secs
    }
}

/// File-backed fingerprint → entry store.
pub struct ExperienceStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl ExperienceStore {
    /// Store under `<root>/.agent/state/experience.json`.
    pub fn for_repo(root: &Path) -> Self {
        Self {
            path: root.join(".agent").join("state").join("experience.json"),
            guard: Mutex::new(()),
        }
    }

    /// Look up a fingerprint, validating TTL and file hashes against the
    /// repository at `root`. Invalid entries are removed as a side effect.
    #[instrument(skip_all, fields(fingerprint = %short(fingerprint)))]
    pub fn lookup(&self, fingerprint: &str, root: &Path) -> Result<Option<ExperienceEntry>> {
        let _held = self.guard.lock().expect("experience store lock poisoned");
        let mut map = self.load()?;
        let Some(entry) = map.get(fingerprint).cloned() else {
            return Ok(None);
        };

        if entry.expired(now_epoch_secs()) {
            debug!("entry expired, dropping");
            map.remove(fingerprint);
            self.persist(&map)?;
            return Ok(None);
        }

        for (path, expected_hash) in &entry.file_hashes {
            let current = fs::read(root.join(path)).ok();
            let matches = current
                .map(|bytes| content_hash(&bytes) == *expected_hash)
                .unwrap_or(false);
            if !matches {
                debug!(path = %path.display(), "referenced file drifted, dropping entry");
                map.remove(fingerprint);
                self.persist(&map)?;
                return Ok(None);
            }
        }

        debug!("cache hit");
        Ok(Some(entry))
    }

    /// Record an entry, replacing any previous value for the fingerprint.
    #[instrument(skip_all, fields(fingerprint = %short(&entry.fingerprint)))]
    pub fn record(&self, entry: ExperienceEntry) -> Result<()> {
        let _held = self.guard.lock().expect("experience store lock poisoned");
        let mut map = self.load()?;
        map.insert(entry.fingerprint.clone(), entry);
        self.persist(&map)
    }

    fn load(&self) -> Result<BTreeMap<String, ExperienceEntry>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", self.path.display()))
    }

    fn persist(&self, map: &BTreeMap<String, ExperienceEntry>) -> Result<()> {
        let parent = self
            .path
            .parent()
            .with_context(|| format!("store path missing parent {}", self.path.display()))?;
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        let mut buf = serde_json::to_string_pretty(map).context("serialize experience store")?;
        buf.push('\n');
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, buf)
            .with_context(|| format!("write temp store {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace store {}", self.path.display()))?;
        Ok(())
    }
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{Step, StepAction};

    fn sample_plan() -> Plan {
        Plan {
            steps: vec![Step {
                description: "update module".to_string(),
                action: StepAction::Modify,
                files: vec![PathBuf::from("src/x.rs")],
            }],
        }
    }

    fn entry(root: &Path, fingerprint: &str, ttl_secs: u64) -> ExperienceEntry {
        let content = fs::read(root.join("src/x.rs")).expect("read seeded file");
        let mut file_hashes = BTreeMap::new();
        file_hashes.insert(PathBuf::from("src/x.rs"), content_hash(&content));
        ExperienceEntry {
            fingerprint: fingerprint.to_string(),
            plan: sample_plan(),
            outcome: CachedOutcome::Success,
            file_hashes,
            recorded_at_epoch_secs: now_epoch_secs(),
            ttl_secs,
        }
    }

    fn seeded_repo() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("src/x.rs"), "pub fn x() {}\n").expect("write");
        temp
    }

    #[test]
    fn record_then_lookup_round_trips() {
        let temp = seeded_repo();
        let store = ExperienceStore::for_repo(temp.path());
        store.record(entry(temp.path(), "fp-1", 3600)).expect("record");

        let hit = store.lookup("fp-1", temp.path()).expect("lookup");
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().outcome, CachedOutcome::Success);
    }

    #[test]
    fn lookup_survives_process_restart() {
        let temp = seeded_repo();
        {
            let store = ExperienceStore::for_repo(temp.path());
            store.record(entry(temp.path(), "fp-1", 3600)).expect("record");
        }
        let reopened = ExperienceStore::for_repo(temp.path());
        assert!(reopened.lookup("fp-1", temp.path()).expect("lookup").is_some());
    }

    #[test]
    fn drifted_file_invalidates_entry() {
        let temp = seeded_repo();
        let store = ExperienceStore::for_repo(temp.path());
        store.record(entry(temp.path(), "fp-1", 3600)).expect("record");

        fs::write(temp.path().join("src/x.rs"), "pub fn y() {}\n").expect("drift");
        assert!(store.lookup("fp-1", temp.path()).expect("lookup").is_none());
        // Entry was dropped, not just hidden.
        fs::write(temp.path().join("src/x.rs"), "pub fn x() {}\n").expect("restore");
        assert!(store.lookup("fp-1", temp.path()).expect("lookup").is_none());
    }

    #[test]
    fn expired_entry_is_dropped() {
        let temp = seeded_repo();
        let store = ExperienceStore::for_repo(temp.path());
        let mut stale = entry(temp.path(), "fp-1", 10);
        stale.recorded_at_epoch_secs = now_epoch_secs() - 60;
        store.record(stale).expect("record");

        assert!(store.lookup("fp-1", temp.path()).expect("lookup").is_none());
    }

    #[test]
    fn unknown_fingerprint_misses() {
        let temp = seeded_repo();
        let store = ExperienceStore::for_repo(temp.path());
        assert!(store.lookup("missing", temp.path()).expect("lookup").is_none());
    }
}
