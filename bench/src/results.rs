//! Benchmark results and the append-only history log.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// One scored case run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestOutcome {
    pub id: String,
    pub category: String,
    pub passed: bool,
    pub weight: f64,
    /// Failure detail; empty on pass.
    #[serde(default)]
    pub detail: String,
}

/// Weighted pass fraction for one category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryScore {
    pub passed: u32,
    pub total: u32,
    pub score: f64,
}

/// Immutable record of one suite run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkResult {
    pub timestamp: String,
    /// Task id of the self-improvement change under evaluation, if any.
    pub source_task_id: Option<String>,
    /// SHA-256 over the case files; two results are comparable only when
    /// their seed hashes match.
    #[serde(default)]
    pub seed_hash: String,
    pub categories: BTreeMap<String, CategoryScore>,
    pub tests: Vec<TestOutcome>,
    /// Weighted mean over all cases, 0.0..=1.0.
    pub aggregate: f64,
}

impl BenchmarkResult {
    pub fn from_outcomes(
        tests: Vec<TestOutcome>,
        source_task_id: Option<String>,
        seed_hash: String,
    ) -> Self {
        let mut categories: BTreeMap<String, (u32, u32, f64, f64)> = BTreeMap::new();
        let mut weight_sum = 0.0;
        let mut weighted_passed = 0.0;

        for test in &tests {
            let entry = categories
                .entry(test.category.clone())
                .or_insert((0, 0, 0.0, 0.0));
            entry.1 += 1;
            entry.3 += test.weight;
            if test.passed {
                entry.0 += 1;
                entry.2 += test.weight;
            }
            weight_sum += test.weight;
            if test.passed {
                weighted_passed += test.weight;
            }
        }

        let categories = categories
            .into_iter()
            .map(|(category, (passed, total, passed_weight, total_weight))| {
                let score = if total_weight > 0.0 {
                    passed_weight / total_weight
                } else {
                    0.0
                };
                (
                    category,
                    CategoryScore {
                        passed,
                        total,
                        score,
                    },
                )
            })
            .collect();

        let aggregate = if weight_sum > 0.0 {
            weighted_passed / weight_sum
        } else {
            0.0
        };

        Self {
            timestamp: Utc::now().to_rfc3339(),
            source_task_id,
            seed_hash,
            categories,
            tests,
            aggregate,
        }
    }

    pub fn failing_tests(&self, category: &str) -> Vec<&TestOutcome> {
        self.tests
            .iter()
            .filter(|test| test.category == category && !test.passed)
            .collect()
    }
}

fn history_path(root: &Path) -> PathBuf {
    root.join(".agent").join("bench").join("history.jsonl")
}

/// Append a result to the history log (one JSON object per line).
#[instrument(skip_all, fields(aggregate = result.aggregate))]
pub fn append_history(root: &Path, result: &BenchmarkResult) -> Result<()> {
    let path = history_path(root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let line = serde_json::to_string(result).context("serialize benchmark result")?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("append {}", path.display()))?;
    debug!(path = %path.display(), "benchmark result appended");
    Ok(())
}

/// Read the full history, oldest first. Missing log yields an empty list.
pub fn read_history(root: &Path) -> Result<Vec<BenchmarkResult>> {
    let path = history_path(root);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let mut results = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let result: BenchmarkResult = serde_json::from_str(line)
            .with_context(|| format!("parse history line {}", index + 1))?;
        results.push(result);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, category: &str, passed: bool, weight: f64) -> TestOutcome {
        TestOutcome {
            id: id.to_string(),
            category: category.to_string(),
            passed,
            weight,
            detail: String::new(),
        }
    }

    #[test]
    fn aggregates_weighted_scores_per_category() {
        let result = BenchmarkResult::from_outcomes(
            vec![
                outcome("a", "intent", true, 1.0),
                outcome("b", "intent", false, 1.0),
                outcome("c", "editing", true, 2.0),
            ],
            None,
            "seed".to_string(),
        );
        assert_eq!(result.categories["intent"].passed, 1);
        assert_eq!(result.categories["intent"].total, 2);
        assert!((result.categories["intent"].score - 0.5).abs() < 1e-9);
        assert!((result.categories["editing"].score - 1.0).abs() < 1e-9);
        assert!((result.aggregate - 3.0 / 4.0).abs() < 1e-9);
    }

    #[test]
    fn failing_tests_filters_by_category() {
        let result = BenchmarkResult::from_outcomes(
            vec![
                outcome("a", "intent", false, 1.0),
                outcome("b", "editing", false, 1.0),
            ],
            None,
            "seed".to_string(),
        );
        let failing = result.failing_tests("intent");
        assert_eq!(failing.len(), 1);
        assert_eq!(failing[0].id, "a");
    }

    #[test]
    fn history_appends_and_reads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = BenchmarkResult::from_outcomes(
            vec![outcome("a", "intent", true, 1.0)],
            None,
            "seed".to_string(),
        );
        let second = BenchmarkResult::from_outcomes(
            vec![outcome("a", "intent", false, 1.0)],
            Some("task-1".to_string()),
            "seed".to_string(),
        );

        append_history(temp.path(), &first).expect("append");
        append_history(temp.path(), &second).expect("append");

        let history = read_history(temp.path()).expect("read");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].aggregate, 1.0);
        assert_eq!(history[1].source_task_id, Some("task-1".to_string()));
    }

    #[test]
    fn missing_history_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(read_history(temp.path()).expect("read").is_empty());
    }
}
