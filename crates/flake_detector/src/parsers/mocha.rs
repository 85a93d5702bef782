//! Mocha-style JSON results parser.
//!
//! The reporter appends one report per suite run to an array-valued artifact:
//! `[{stats, passes: [{title, file, ...}], failures: [...], pending: [...]}]`.

use super::ParseError;
use crate::normalize::path::test_file_key;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Outcome entry of one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestOutcome {
    pub title: String,
    /// Test file key, relative to the test directory.
    pub file: String,
}

/// Aggregate counters as reported, when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    #[serde(default)]
    pub tests: u64,
    #[serde(default)]
    pub passes: u64,
    #[serde(default)]
    pub failures: u64,
    #[serde(default)]
    pub pending: u64,
    #[serde(default)]
    pub duration: Option<u64>,
}

/// Result of one suite run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub stats: Option<RunStats>,
    pub passes: Vec<TestOutcome>,
    pub failures: Vec<TestOutcome>,
    pub pending: Vec<TestOutcome>,
}

impl ExecutionReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawArtifact {
    Runs(Vec<RawReport>),
    Single(RawReport),
}

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(default)]
    stats: Option<RunStats>,
    #[serde(default)]
    passes: Vec<RawTest>,
    #[serde(default)]
    failures: Vec<RawTest>,
    #[serde(default)]
    pending: Vec<RawTest>,
}

#[derive(Debug, Deserialize)]
struct RawTest {
    title: String,
    #[serde(default)]
    file: Option<String>,
}

/// Parses the results artifact into one report per run, in run order.
///
/// # Arguments
/// * `json_content` - Raw artifact content
/// * `test_dir` - Test directory for normalizing test file paths
pub fn parse(json_content: &str, test_dir: &Path) -> Result<Vec<ExecutionReport>, ParseError> {
    let raw: RawArtifact = serde_json::from_str(json_content)?;
    let runs = match raw {
        RawArtifact::Runs(runs) => runs,
        RawArtifact::Single(run) => vec![run],
    };

    runs.into_iter()
        .enumerate()
        .map(|(idx, run)| convert(run, idx + 1, test_dir))
        .collect()
}

fn convert(raw: RawReport, run: usize, test_dir: &Path) -> Result<ExecutionReport, ParseError> {
    let outcomes = |tests: Vec<RawTest>| -> Result<Vec<TestOutcome>, ParseError> {
        tests
            .into_iter()
            .map(|t| {
                let file = t.file.ok_or_else(|| ParseError::MissingFile {
                    run,
                    title: t.title.clone(),
                })?;
                Ok(TestOutcome {
                    file: test_file_key(&file, test_dir),
                    title: t.title,
                })
            })
            .collect()
    };

    Ok(ExecutionReport {
        stats: raw.stats,
        passes: outcomes(raw.passes)?,
        failures: outcomes(raw.failures)?,
        pending: outcomes(raw.pending)?,
    })
}
