//! Diff-mode classification.
//!
//! A failure that ran changed code is presumed a regression. A failure that
//! ran code but none of the changed lines is unexplained by the diff, and that
//! is the signal this mode reports as flaky.

use super::overlap::test_touches_diff;
use super::verdict::FlakyVerdict;
use crate::diff::DiffSnapshot;
use crate::parsers::mocha::ExecutionReport;
use crate::trace::{CoverageMap, TestCoverage};
use tracing::debug;

/// Flaky tests of one run, judged against the diff.
///
/// Failing tests without coverage are left out: executing nothing is not
/// evidence of flakiness.
pub fn join_failures(
    report: &ExecutionReport,
    coverage: &CoverageMap,
    diff: &DiffSnapshot,
) -> FlakyVerdict {
    let mut verdict = FlakyVerdict::new();

    for failure in &report.failures {
        match coverage.get(&failure.file, &failure.title) {
            None | Some(TestCoverage::Uncovered) => {
                debug!(
                    "[analysis] {} :: {} failed without coverage, skipped",
                    failure.file, failure.title
                );
            }
            Some(covered) => {
                if test_touches_diff(covered, diff) {
                    debug!(
                        "[analysis] {} :: {} failed on changed code",
                        failure.file, failure.title
                    );
                } else {
                    verdict.add(&failure.file, &failure.title);
                }
            }
        }
    }

    verdict
}
