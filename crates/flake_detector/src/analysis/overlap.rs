//! Correlates a test's coverage with the diff.

use crate::diff::DiffSnapshot;
use crate::trace::TestCoverage;

/// Whether the test executed any line changed in `diff`.
///
/// Files the test covered but the diff does not mention were not modified and
/// are skipped. A whole-file entry (new or untracked file) matches on any
/// coverage of that path. A test with no coverage never matches.
pub fn test_touches_diff(coverage: &TestCoverage, diff: &DiffSnapshot) -> bool {
    let TestCoverage::Covered(files) = coverage else {
        return false;
    };

    files.iter().any(|(path, covered)| {
        diff.get(path).is_some_and(|file_diff| {
            (file_diff.whole_file && !covered.is_empty()) || covered.overlaps(&file_diff.ranges)
        })
    })
}
