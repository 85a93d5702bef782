//! Annotates flaky tests in their source files.
//!
//! The marker line is inserted directly above each flaky test's definition
//! statement. Applying the same verdict twice changes nothing the second time.

pub mod discovery;
pub mod locate;

pub use discovery::discover_test_files;
pub use locate::find_test_definitions;

use crate::analysis::FlakyVerdict;
use crate::normalize::path::test_file_key;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_MARKER: &str = "// Suspected flaky test";

/// Errors that can occur while annotating test files.
#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("syntax errors in {}", .0.display())]
    Syntax(PathBuf),
    #[error("failed to load grammar: {0}")]
    Language(String),
    #[error("invalid test query: {0}")]
    Query(String),
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// What a marking pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkSummary {
    pub files_changed: usize,
    pub tests_marked: usize,
    /// Files skipped because they failed to parse.
    pub skipped: Vec<PathBuf>,
}

/// Insert `marker` above every definition of `titles` in `content`.
///
/// Returns `None` when nothing needs inserting.
pub fn annotate(
    content: &str,
    path: &Path,
    titles: &[String],
    marker: &str,
) -> Result<Option<(String, usize)>, MarkerError> {
    let wanted: HashSet<&str> = titles.iter().map(String::as_str).collect();
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let marker = marker.trim();

    // row -> indentation
    let mut targets: BTreeMap<usize, String> = BTreeMap::new();
    for def in find_test_definitions(content, path)? {
        if !wanted.contains(def.title.as_str()) {
            continue;
        }
        let already_marked = def
            .row
            .checked_sub(1)
            .and_then(|prev| lines.get(prev))
            .is_some_and(|line| line.trim() == marker);
        if already_marked {
            debug!("[marker] {} :: {} already marked", path.display(), def.title);
            continue;
        }
        targets.insert(def.row, def.indent);
    }

    if targets.is_empty() {
        return Ok(None);
    }

    let mut out = String::with_capacity(content.len() + targets.len() * (marker.len() + 8));
    for (row, line) in lines.iter().enumerate() {
        if let Some(indent) = targets.get(&row) {
            let eol = if line.ends_with("\r\n") { "\r\n" } else { "\n" };
            out.push_str(indent);
            out.push_str(marker);
            out.push_str(eol);
        }
        out.push_str(line);
    }

    Ok(Some((out, targets.len())))
}

/// Annotate every test file under `test_dir` that the verdict names.
///
/// Files that fail to parse are skipped with a warning; I/O failures abort.
pub fn apply_verdict(
    verdict: &FlakyVerdict,
    test_dir: &Path,
    marker: &str,
) -> Result<MarkSummary, MarkerError> {
    let mut summary = MarkSummary::default();
    let mut seen: HashSet<String> = HashSet::new();

    for file in discover_test_files(test_dir) {
        let key = test_file_key(&file.to_string_lossy(), test_dir);
        let titles = verdict.titles_for(&key);
        if titles.is_empty() {
            continue;
        }
        seen.insert(key);

        let content = std::fs::read_to_string(&file).map_err(|source| MarkerError::Io {
            path: file.clone(),
            source,
        })?;

        let annotated = match annotate(&content, &file, titles, marker) {
            Ok(annotated) => annotated,
            Err(MarkerError::Syntax(path)) => {
                warn!("[marker] skipping {}: syntax errors", path.display());
                summary.skipped.push(path);
                continue;
            }
            Err(e) => return Err(e),
        };

        if let Some((updated, count)) = annotated {
            std::fs::write(&file, updated).map_err(|source| MarkerError::Io {
                path: file.clone(),
                source,
            })?;
            info!("[marker] marked {count} test(s) in {}", file.display());
            summary.files_changed += 1;
            summary.tests_marked += count;
        }
    }

    for (key, _) in verdict.files() {
        if !seen.contains(key) {
            warn!("[marker] no test file found for {key}");
        }
    }

    Ok(summary)
}
