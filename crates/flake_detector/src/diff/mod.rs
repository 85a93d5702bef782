//! Diff range extraction.
//!
//! Turns per-file hunk headers supplied by the diff collaborator into a
//! `DiffSnapshot`: repository-relative path to the lines changed in it.

pub mod git;
pub mod hunk;

use crate::normalize::path::repo_relative;
use crate::ranges::RangeSet;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while building a diff snapshot.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("malformed hunk header in {path}: {header:?}")]
    MalformedDiffHeader { path: String, header: String },
    #[error("git error: {0}")]
    Git(String),
}

/// Raw diff data for one file, as handed over by the diff collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub path: String,
    /// Hunk headers; empty for untracked or otherwise header-less files.
    pub headers: Vec<String>,
}

impl FilePatch {
    pub fn new(path: impl Into<String>, headers: Vec<String>) -> Self {
        Self {
            path: path.into(),
            headers,
        }
    }
}

/// Modified lines of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub ranges: RangeSet,
    /// Set when the file had no hunk headers: every line counts as changed.
    pub whole_file: bool,
}

impl FileDiff {
    /// Build from hunk headers. A malformed header fails the whole file.
    pub fn from_headers(path: &str, headers: &[String]) -> Result<Self, DiffError> {
        if headers.is_empty() {
            return Ok(Self::whole_file(path));
        }

        let mut spans = Vec::with_capacity(headers.len());
        for header in headers {
            let span = hunk::parse_header(header).ok_or_else(|| DiffError::MalformedDiffHeader {
                path: path.to_string(),
                header: header.clone(),
            })?;
            spans.push(span.to_range());
        }

        Ok(Self {
            path: path.to_string(),
            ranges: RangeSet::from_ranges(spans),
            whole_file: false,
        })
    }

    /// A new or untracked file.
    pub fn whole_file(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ranges: RangeSet::new(),
            whole_file: true,
        }
    }
}

/// Every modified file of one analysis run, keyed by repository-relative path.
#[derive(Debug, Clone, Default)]
pub struct DiffSnapshot {
    files: BTreeMap<String, FileDiff>,
}

impl DiffSnapshot {
    /// Build the snapshot. Any malformed header aborts the build: a dropped
    /// range would make a real regression look unrelated to the change.
    pub fn build(patches: &[FilePatch], repo_root: &Path) -> Result<Self, DiffError> {
        let mut files = BTreeMap::new();
        for patch in patches {
            let key = repo_relative(&patch.path, repo_root);
            let diff = FileDiff::from_headers(&key, &patch.headers)?;
            files.insert(key, diff);
        }
        Ok(Self { files })
    }

    pub fn get(&self, path: &str) -> Option<&FileDiff> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileDiff> {
        self.files.values()
    }
}

impl FromIterator<FileDiff> for DiffSnapshot {
    fn from_iter<I: IntoIterator<Item = FileDiff>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().map(|d| (d.path.clone(), d)).collect(),
        }
    }
}
