//! Coverage compilation.
//!
//! Each return record spans every line from the function's entry to its exit.
//! That overapproximates execution (untaken branches count as run), which is
//! accepted: it can only make a test look more related to a change.

use super::{EventKind, TestTrace};
use crate::normalize::path::{repo_relative, test_file_key};
use crate::ranges::{LineRange, RangeSet};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Identifies a test in the coverage map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestKey {
    /// Test file key, when the trace recorded one.
    pub test_file: Option<String>,
    pub title: String,
}

/// Lines a single test executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestCoverage {
    /// The test ran but no traced frame returned.
    Uncovered,
    /// Repository-relative file path to covered lines.
    Covered(BTreeMap<String, RangeSet>),
}

/// Coverage of every traced test.
#[derive(Debug, Clone, Default)]
pub struct CoverageMap {
    tests: BTreeMap<TestKey, TestCoverage>,
}

impl CoverageMap {
    /// Look up a test by file key and title.
    ///
    /// Falls back to the title-only entry written by instrumentation that
    /// does not record the owning test file.
    pub fn get(&self, test_file: &str, title: &str) -> Option<&TestCoverage> {
        let exact = TestKey {
            test_file: Some(test_file.to_string()),
            title: title.to_string(),
        };
        self.tests.get(&exact).or_else(|| {
            self.tests.get(&TestKey {
                test_file: None,
                title: title.to_string(),
            })
        })
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Reduce parsed traces to per-test, per-file line sets.
///
/// Call records are redundant with their returns and skipped. A return whose
/// exit line precedes its entry (re-entrant frames) is swapped, never dropped.
/// Segments sharing a key are merged.
pub fn compile(traces: &[TestTrace], repo_root: &Path, test_dir: &Path) -> CoverageMap {
    let mut spans: BTreeMap<TestKey, BTreeMap<String, Vec<LineRange>>> = BTreeMap::new();

    for trace in traces {
        let key = TestKey {
            test_file: trace.test_file.as_deref().map(|f| test_file_key(f, test_dir)),
            title: trace.title.clone(),
        };
        let files = spans.entry(key).or_default();

        for event in &trace.events {
            if event.kind != EventKind::Return {
                continue;
            }
            let Some(exit) = event.return_line else {
                continue;
            };
            if exit < event.line {
                debug!(
                    "[trace] {} in {} returned at {exit} before entry {}",
                    event.function, event.file, event.line
                );
            }
            let file = repo_relative(&event.file, repo_root);
            files
                .entry(file)
                .or_default()
                .push(LineRange::new(event.line, exit));
        }
    }

    let tests = spans
        .into_iter()
        .map(|(key, files)| {
            let coverage = if files.is_empty() {
                TestCoverage::Uncovered
            } else {
                TestCoverage::Covered(
                    files
                        .into_iter()
                        .map(|(file, ranges)| (file, RangeSet::from_ranges(ranges)))
                        .collect(),
                )
            };
            (key, coverage)
        })
        .collect();

    CoverageMap { tests }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::trace::parse_log;

    const ROOT: &str = "/repo";
    const TEST_DIR: &str = "/repo/test";

    fn compile_log(log: &str) -> CoverageMap {
        let traces = parse_log(log).unwrap();
        compile(&traces, Path::new(ROOT), Path::new(TEST_DIR))
    }

    fn covered<'a>(map: &'a CoverageMap, file: &str, title: &str) -> &'a BTreeMap<String, RangeSet> {
        match map.get(file, title).unwrap() {
            TestCoverage::Covered(files) => files,
            TestCoverage::Uncovered => panic!("expected coverage for {title}"),
        }
    }

    #[test]
    fn returns_become_repo_relative_ranges() {
        let map = compile_log(
            "testsplit\nT1\n/repo/test/a.test.js\n\
             call,/repo/src/a.js,f,10\n\
             return,/repo/src/a.js,f,10,12\n\
             return,/repo/src/a.js,g,13,15\n\
             return,/repo/lib/b.js,h,40,41\n",
        );
        let files = covered(&map, "a.test.js", "T1");
        assert_eq!(files["src/a.js"].to_string(), "10-15");
        assert_eq!(files["lib/b.js"].to_string(), "40-41");
    }

    #[test]
    fn reversed_span_is_swapped() {
        let map = compile_log("testsplit\nT\nreturn,/repo/src/a.js,rec,20,18\n");
        let files = covered(&map, "x.test.js", "T");
        assert_eq!(files["src/a.js"].to_string(), "18-20");
    }

    #[test]
    fn calls_only_segment_is_uncovered() {
        let map = compile_log("testsplit\nT\n/repo/test/a.test.js\ncall,/repo/src/a.js,f,3\n");
        assert_eq!(map.get("a.test.js", "T"), Some(&TestCoverage::Uncovered));
    }

    #[test]
    fn empty_segment_is_uncovered() {
        let map = compile_log("testsplit\nT\n");
        assert_eq!(map.get("any.js", "T"), Some(&TestCoverage::Uncovered));
    }

    #[test]
    fn lookup_prefers_exact_test_file() {
        let map = compile_log(
            "testsplit\nsame\n/repo/test/a.test.js\nreturn,/repo/src/a.js,f,1,2\n\
             testsplit\nsame\n/repo/test/b.test.js\nreturn,/repo/src/b.js,f,5,6\n",
        );
        assert_eq!(map.len(), 2);
        assert!(covered(&map, "a.test.js", "same").contains_key("src/a.js"));
        assert!(covered(&map, "b.test.js", "same").contains_key("src/b.js"));
        assert!(map.get("c.test.js", "same").is_none());
    }

    #[test]
    fn repeated_segments_are_merged() {
        let map = compile_log(
            "testsplit\nT\nreturn,/repo/src/a.js,f,1,2\n\
             testsplit\nT\nreturn,/repo/src/a.js,f,3,4\n",
        );
        assert_eq!(covered(&map, "t.js", "T")["src/a.js"].to_string(), "1-4");
    }

    #[test]
    fn unknown_test_is_absent() {
        let map = compile_log("testsplit\nT\n");
        assert!(map.get("t.js", "missing").is_none());
    }
}
