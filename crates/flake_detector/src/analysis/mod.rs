//! Flakiness determination.
//!
//! Combines diff snapshots, coverage and execution reports into a
//! `FlakyVerdict`, either by diff correlation or by rerun variance.

pub mod joiner;
pub mod overlap;
pub mod rerun;
pub mod verdict;

pub use joiner::join_failures;
pub use rerun::{classify_reruns, RerunHistory};
pub use verdict::FlakyVerdict;

use thiserror::Error;

/// Errors that can occur while classifying tests.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("test {title:?} in {file} has no outcome in run {run}")]
    MissingOutcome {
        file: String,
        title: String,
        run: usize,
    },
}
