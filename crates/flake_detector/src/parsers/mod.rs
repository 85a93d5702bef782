//! Artifact parsers for test execution reports.

pub mod mocha;

use thiserror::Error;

/// Errors that can occur during artifact parsing.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("run {run}: test {title:?} has no file")]
    MissingFile { run: usize, title: String },
    #[error("results artifact holds no runs")]
    NoRuns,
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        ParseError::InvalidJson(e.to_string())
    }
}
