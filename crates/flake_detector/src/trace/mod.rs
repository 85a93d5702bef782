//! Execution trace handling.
//!
//! The instrumentation collaborator writes a plain-text log of call/return
//! records split into per-test segments. `parser` turns the log into
//! `TestTrace`s, `compiler` reduces those to per-test, per-file covered lines.

pub mod compiler;
pub mod parser;

pub use compiler::{compile, CoverageMap, TestCoverage};
pub use parser::parse_log;

use thiserror::Error;

/// Line separating one test's records from the next.
pub const BOUNDARY: &str = "testsplit";
/// Last line of a complete trace log.
pub const END_SENTINEL: &str = "testingended";

/// Errors that can occur while reading a trace log.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("malformed trace record at line {line_number}: {record:?}")]
    MalformedTraceRecord { line_number: usize, record: String },
}

/// Kind of a trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Call,
    Return,
}

/// One call or return record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub kind: EventKind,
    pub file: String,
    pub function: String,
    pub line: u32,
    /// Exit line; only present on returns.
    pub return_line: Option<u32>,
}

/// All records of a single test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTrace {
    pub title: String,
    pub test_file: Option<String>,
    pub events: Vec<TraceEvent>,
}
