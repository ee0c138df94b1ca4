//! Suite execution: run every case deterministically and score it.
//!
//! Intent cases score the classifier rule layer in-process. Task cases run
//! the full pipeline in isolated workspaces with replayed completions.
//! Independent task cases run on a bounded worker pool; cases whose seeded
//! files overlap are never run concurrently.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use agent::context::AgentContext;
use agent::core::intent::classify_rules;
use agent::io::config::{AgentConfig, TrustLevel};
use agent::planning::AutoApprover;
use agent::task::{TaskOutcome, run_task};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::case::{CaseFile, TaskCase, discover_cases};
use crate::judge::{CommandLimits, run_checks};
use crate::replay::ReplayCompletion;
use crate::results::{BenchmarkResult, TestOutcome};
use crate::workspace::create_workspace;

/// Bounded worker pool size for independent task cases.
pub const MAX_PARALLEL_CASES: usize = 4;

/// Run the whole suite from `cases_dir`, using `workspaces_dir` for task
/// case checkouts.
#[instrument(skip_all)]
pub fn run_suite(
    cases_dir: &Path,
    workspaces_dir: &Path,
    source_task_id: Option<String>,
) -> Result<BenchmarkResult> {
    let cases = discover_cases(cases_dir)?;
    info!(cases = cases.len(), "suite started");

    let mut outcomes: Vec<TestOutcome> = Vec::new();
    let mut task_cases: Vec<&CaseFile> = Vec::new();

    for case in &cases {
        if let Some(intent_case) = &case.intent {
            outcomes.push(score_intent_case(case, intent_case));
        } else if case.task.is_some() {
            task_cases.push(case);
        }
    }

    for wave in partition_waves(&task_cases) {
        outcomes.extend(run_wave(&wave, workspaces_dir));
    }

    // Restore deterministic ordering regardless of scheduling.
    outcomes.sort_by(|a, b| (a.category.as_str(), a.id.as_str()).cmp(&(b.category.as_str(), b.id.as_str())));

    let result = BenchmarkResult::from_outcomes(outcomes, source_task_id, seed_hash(cases_dir)?);
    info!(aggregate = result.aggregate, "suite finished");
    Ok(result)
}

/// Hash the case files so results from different seeds are never compared.
fn seed_hash(cases_dir: &Path) -> Result<String> {
    let mut paths: Vec<_> = if cases_dir.exists() {
        fs::read_dir(cases_dir)
            .with_context(|| format!("read {}", cases_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("toml"))
            .collect()
    } else {
        Vec::new()
    };
    paths.sort();

    let mut hasher = Sha256::new();
    for path in paths {
        let contents = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        hasher.update(path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default());
        hasher.update(b"\0");
        hasher.update(&contents);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn score_intent_case(case: &CaseFile, intent_case: &crate::case::IntentCase) -> TestOutcome {
    let (passed, detail) = match classify_rules(&intent_case.request) {
        Some(classification) if classification.intent == intent_case.expected => {
            (true, String::new())
        }
        Some(classification) => (
            false,
            format!(
                "expected {}, rules said {}",
                intent_case.expected.as_str(),
                classification.intent.as_str()
            ),
        ),
        None => (
            false,
            format!("expected {}, rule layer abstained", intent_case.expected.as_str()),
        ),
    };
    debug!(id = %case.case.id, passed, "intent case scored");
    TestOutcome {
        id: case.case.id.clone(),
        category: case.case.category.clone(),
        passed,
        weight: case.case.weight,
        detail,
    }
}

/// Partition task cases into waves whose members seed disjoint file sets.
/// Waves run one after another; members of a wave may run concurrently.
fn partition_waves<'a>(cases: &[&'a CaseFile]) -> Vec<Vec<&'a CaseFile>> {
    let mut waves: Vec<Vec<&CaseFile>> = Vec::new();
    for case in cases {
        let task = case.task.as_ref().expect("task case");
        let slot = waves.iter_mut().find(|wave| {
            wave.iter().all(|member| {
                let member_task = member.task.as_ref().expect("task case");
                !overlaps(task, member_task)
            })
        });
        match slot {
            Some(wave) => wave.push(case),
            None => waves.push(vec![case]),
        }
    }
    waves
}

fn overlaps(left: &TaskCase, right: &TaskCase) -> bool {
    let right_paths = right.seeded_paths();
    left.seeded_paths()
        .iter()
        .any(|path| right_paths.contains(path))
}

fn run_wave(wave: &[&CaseFile], workspaces_dir: &Path) -> Vec<TestOutcome> {
    let collected: Mutex<Vec<TestOutcome>> = Mutex::new(Vec::with_capacity(wave.len()));
    for chunk in wave.chunks(MAX_PARALLEL_CASES) {
        std::thread::scope(|scope| {
            for case in chunk {
                let collected = &collected;
                scope.spawn(move || {
                    let outcome = run_task_case(case, workspaces_dir);
                    collected.lock().expect("outcome lock").push(outcome);
                });
            }
        });
    }
    collected.into_inner().expect("outcome lock")
}

fn run_task_case(case: &CaseFile, workspaces_dir: &Path) -> TestOutcome {
    let task = case.task.as_ref().expect("task case");
    let fail = |detail: String| TestOutcome {
        id: case.case.id.clone(),
        category: case.case.category.clone(),
        passed: false,
        weight: case.case.weight,
        detail,
    };

    let workspace = match create_workspace(workspaces_dir, &case.case.id, task) {
        Ok(workspace) => workspace,
        Err(err) => return fail(format!("workspace: {err:#}")),
    };

    let config = AgentConfig {
        trust: TrustLevel::Auto,
        completion_retries: 0,
        lock_timeout_secs: 1,
        ..AgentConfig::default()
    };
    let ctx = AgentContext::with_config(&workspace.root, config);
    let completion = ReplayCompletion::new(&task.completions);

    let run = run_task(&ctx, &completion, &AutoApprover, &task.request, None);
    let completed = matches!(run, Ok(TaskOutcome::Completed(_)));
    if let Err(err) = &run {
        warn!(id = %case.case.id, err = %err, "task case pipeline errored");
    }

    let judgment = match run_checks(
        &task.checks,
        &workspace.root,
        completed,
        CommandLimits::default_limits(),
    ) {
        Ok(judgment) => judgment,
        Err(err) => return fail(format!("checks: {err:#}")),
    };

    let passed = judgment.all_passed();
    debug!(id = %case.case.id, passed, "task case scored");
    TestOutcome {
        id: case.case.id.clone(),
        category: case.case.category.clone(),
        passed,
        weight: case.case.weight,
        detail: if passed {
            String::new()
        } else {
            judgment.failure_summary()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_case(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).expect("write case");
    }

    #[test]
    fn intent_cases_score_deterministically() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cases = temp.path().join("cases");
        fs::create_dir_all(&cases).expect("mkdir");
        write_case(
            &cases,
            "greet.toml",
            "[case]\nid = \"greet\"\ncategory = \"intent\"\n\n[intent]\nrequest = \"hello\"\nexpected = \"chat\"\n",
        );
        write_case(
            &cases,
            "vague.toml",
            "[case]\nid = \"vague\"\ncategory = \"intent\"\n\n[intent]\nrequest = \"fix it\"\nexpected = \"clarify\"\n",
        );
        write_case(
            &cases,
            "wrong.toml",
            "[case]\nid = \"wrong\"\ncategory = \"intent\"\n\n[intent]\nrequest = \"hello\"\nexpected = \"code-task\"\n",
        );

        let first = run_suite(&cases, &temp.path().join("ws"), None).expect("suite");
        assert_eq!(first.categories["intent"].passed, 2);
        assert_eq!(first.categories["intent"].total, 3);

        let second = run_suite(&cases, &temp.path().join("ws2"), None).expect("suite");
        assert_eq!(first.categories, second.categories);
        assert_eq!(first.aggregate, second.aggregate);
    }

    #[test]
    fn task_case_runs_pipeline_with_replayed_completions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cases = temp.path().join("cases");
        fs::create_dir_all(&cases).expect("mkdir");
        write_case(
            &cases,
            "add-logging.toml",
            r#"[case]
id = "add-logging"
category = "editing"

[task]
request = "add logging to the worker module"
completions = [
  '{"steps": [{"description": "add tracing to the worker", "action": "modify", "files": ["src/worker.rs"]}]}',
  '{"edits": [{"path": "src/worker.rs", "hunks": [{"old_start": 0, "old_len": 1, "new_lines": ["pub fn work() { tracing::info!(\"work\"); }"]}]}]}',
]

[[task.files]]
path = "src/worker.rs"
contents = "pub fn work() {}\n"

[[task.checks]]
type = "task_completed"

[[task.checks]]
type = "file_contains"
path = "src/worker.rs"
needle = "tracing"
"#,
        );

        let result = run_suite(&cases, &temp.path().join("ws"), None).expect("suite");
        assert_eq!(result.tests.len(), 1);
        assert!(result.tests[0].passed, "detail: {}", result.tests[0].detail);
        assert_eq!(result.aggregate, 1.0);
    }

    #[test]
    fn overlapping_cases_land_in_separate_waves() {
        let shared = |id: &str| {
            format!(
                "[case]\nid = \"{id}\"\ncategory = \"editing\"\n\n[task]\nrequest = \"edit the shared file\"\ncompletions = [\"x\"]\n\n[[task.files]]\npath = \"src/shared.rs\"\ncontents = \"\"\n\n[[task.checks]]\ntype = \"task_completed\"\n"
            )
        };
        let temp = tempfile::tempdir().expect("tempdir");
        let cases_dir = temp.path().join("cases");
        fs::create_dir_all(&cases_dir).expect("mkdir");
        write_case(&cases_dir, "one.toml", &shared("one"));
        write_case(&cases_dir, "two.toml", &shared("two"));

        let cases = discover_cases(&cases_dir).expect("discover");
        let refs: Vec<&CaseFile> = cases.iter().collect();
        let waves = partition_waves(&refs);
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].len(), 1);
    }

    #[test]
    fn disjoint_cases_share_a_wave() {
        let case_for = |id: &str, path: &str| {
            format!(
                "[case]\nid = \"{id}\"\ncategory = \"editing\"\n\n[task]\nrequest = \"edit a file\"\ncompletions = [\"x\"]\n\n[[task.files]]\npath = \"{path}\"\ncontents = \"\"\n\n[[task.checks]]\ntype = \"task_completed\"\n"
            )
        };
        let temp = tempfile::tempdir().expect("tempdir");
        let cases_dir = temp.path().join("cases");
        fs::create_dir_all(&cases_dir).expect("mkdir");
        write_case(&cases_dir, "one.toml", &case_for("one", "src/a.rs"));
        write_case(&cases_dir, "two.toml", &case_for("two", "src/b.rs"));

        let cases = discover_cases(&cases_dir).expect("discover");
        let refs: Vec<&CaseFile> = cases.iter().collect();
        let waves = partition_waves(&refs);
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].len(), 2);
    }
}
