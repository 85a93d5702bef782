//! The flaky verdict handed to the marker.

use serde::Serialize;
use std::collections::BTreeMap;

/// Test file key to the titles judged flaky in it, in detection order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FlakyVerdict {
    files: BTreeMap<String, Vec<String>>,
}

impl FlakyVerdict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a flaky test. Duplicates are ignored.
    pub fn add(&mut self, test_file: &str, title: &str) {
        if self.contains(test_file, title) {
            return;
        }
        self.files
            .entry(test_file.to_string())
            .or_default()
            .push(title.to_string());
    }

    /// Flaky titles for one test file.
    pub fn titles_for(&self, test_file: &str) -> &[String] {
        self.files.get(test_file).map_or(&[], Vec::as_slice)
    }

    pub fn contains(&self, test_file: &str, title: &str) -> bool {
        self.titles_for(test_file).iter().any(|t| t == title)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Number of flaky tests across all files.
    pub fn total(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.files.iter()
    }
}
