//! Rerun-mode classification.
//!
//! A test is flaky when its outcome differs between runs of the same code.
//! Detection power depends entirely on the number of runs.

use super::verdict::FlakyVerdict;
use super::AnalysisError;
use crate::parsers::mocha::{ExecutionReport, TestOutcome};
use std::collections::HashSet;

/// Reports of repeated runs, in run order.
#[derive(Debug, Clone, Default)]
pub struct RerunHistory {
    runs: Vec<ExecutionReport>,
}

impl RerunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, report: ExecutionReport) {
        self.runs.push(report);
    }

    pub fn runs(&self) -> &[ExecutionReport] {
        &self.runs
    }

    /// True when any run reported a failure.
    pub fn has_failures(&self) -> bool {
        self.runs.iter().any(ExecutionReport::has_failures)
    }
}

impl From<Vec<ExecutionReport>> for RerunHistory {
    fn from(runs: Vec<ExecutionReport>) -> Self {
        Self { runs }
    }
}

/// A test is identified by its file key and exact title.
type TestId = (String, String);

/// Classify every test seen in `history`.
///
/// Tests are keyed by file and title, so equal titles in different files are
/// judged separately. Failures are authoritative: a test listed as both passed
/// and failed in a run counts as failed. Pending tests contribute nothing for
/// that run. A test absent from every list of some run is an error.
pub fn classify_reruns(history: &RerunHistory) -> Result<FlakyVerdict, AnalysisError> {
    let mut order: Vec<TestId> = Vec::new();
    let mut seen: HashSet<TestId> = HashSet::new();
    for run in history.runs() {
        for test in run.passes.iter().chain(&run.failures).chain(&run.pending) {
            let id = (test.file.clone(), test.title.clone());
            if seen.insert(id.clone()) {
                order.push(id);
            }
        }
    }

    let mut outcomes: Vec<Vec<bool>> = vec![Vec::new(); order.len()];
    for (idx, run) in history.runs().iter().enumerate() {
        let passed = ids(&run.passes);
        let failed = ids(&run.failures);
        let pending = ids(&run.pending);

        for ((file, title), results) in order.iter().zip(outcomes.iter_mut()) {
            let key = (file.as_str(), title.as_str());
            let result = if failed.contains(&key) {
                false
            } else if passed.contains(&key) {
                true
            } else if pending.contains(&key) {
                continue;
            } else {
                return Err(AnalysisError::MissingOutcome {
                    file: file.clone(),
                    title: title.clone(),
                    run: idx + 1,
                });
            };
            results.push(result);
        }
    }

    let mut verdict = FlakyVerdict::new();
    for ((file, title), results) in order.iter().zip(&outcomes) {
        if is_mixed(results) {
            verdict.add(file, title);
        }
    }
    Ok(verdict)
}

fn ids(tests: &[TestOutcome]) -> HashSet<(&str, &str)> {
    tests
        .iter()
        .map(|t| (t.file.as_str(), t.title.as_str()))
        .collect()
}

/// True when the sequence holds both a pass and a failure.
pub fn is_mixed(results: &[bool]) -> bool {
    results.iter().any(|&r| r) && results.iter().any(|&r| !r)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::parsers::mocha::TestOutcome;

    fn t(title: &str, file: &str) -> TestOutcome {
        TestOutcome {
            title: title.to_string(),
            file: file.to_string(),
        }
    }

    fn run(passes: &[&str], failures: &[&str]) -> ExecutionReport {
        ExecutionReport {
            stats: None,
            passes: passes.iter().map(|p| t(p, "a.test.js")).collect(),
            failures: failures.iter().map(|f| t(f, "a.test.js")).collect(),
            pending: Vec::new(),
        }
    }

    #[test]
    fn uniform_sequences_are_not_mixed() {
        assert!(!is_mixed(&[true, true, true]));
        assert!(!is_mixed(&[false, false]));
        assert!(!is_mixed(&[]));
    }

    #[test]
    fn varying_sequences_are_mixed() {
        assert!(is_mixed(&[true, false]));
        assert!(is_mixed(&[false, true, false]));
    }

    #[test]
    fn classify_marks_only_varying_tests() {
        let history = RerunHistory::from(vec![
            run(&["stable", "wobbly"], &["broken"]),
            run(&["stable"], &["broken", "wobbly"]),
            run(&["stable", "wobbly"], &["broken"]),
        ]);
        let verdict = classify_reruns(&history).unwrap();
        assert_eq!(verdict.titles_for("a.test.js"), ["wobbly"]);
        assert!(history.has_failures());
    }

    #[test]
    fn equal_titles_in_different_files_are_separate_tests() {
        let runs = [true, false, true].map(|b_passes| {
            let mut report = run(&["works"], &[]);
            let other = t("works", "b.test.js");
            if b_passes {
                report.passes.push(other);
            } else {
                report.failures.push(other);
            }
            report
        });

        let verdict = classify_reruns(&RerunHistory::from(runs.to_vec())).unwrap();
        assert_eq!(verdict.titles_for("b.test.js"), ["works"]);
        assert!(verdict.titles_for("a.test.js").is_empty());
    }

    #[test]
    fn test_reported_under_another_file_is_missing() {
        let mut first = run(&[], &[]);
        first.failures.push(t("moved", "old.test.js"));
        let mut second = run(&[], &[]);
        second.passes.push(t("moved", "new.test.js"));

        let err = classify_reruns(&RerunHistory::from(vec![first, second])).unwrap_err();
        assert_eq!(
            err,
            AnalysisError::MissingOutcome {
                file: "old.test.js".to_string(),
                title: "moved".to_string(),
                run: 2
            }
        );
    }

    #[test]
    fn missing_outcome_is_an_error() {
        let history = RerunHistory::from(vec![run(&["a", "b"], &[]), run(&["a"], &[])]);
        assert_eq!(
            classify_reruns(&history).unwrap_err(),
            AnalysisError::MissingOutcome {
                file: "a.test.js".to_string(),
                title: "b".to_string(),
                run: 2
            }
        );
    }

    #[test]
    fn pending_runs_are_skipped() {
        let mut second = run(&[], &[]);
        second.pending.push(t("later", "a.test.js"));
        let history = RerunHistory::from(vec![run(&["later"], &[]), second, run(&["later"], &[])]);
        assert!(classify_reruns(&history).unwrap().is_empty());
    }

    #[test]
    fn failure_wins_over_pass_within_a_run() {
        let history = RerunHistory::from(vec![run(&["x"], &["x"]), run(&["x"], &[])]);
        assert!(classify_reruns(&history).unwrap().contains("a.test.js", "x"));
    }

    #[test]
    fn empty_history_is_empty_verdict() {
        assert!(classify_reruns(&RerunHistory::new()).unwrap().is_empty());
    }
}
