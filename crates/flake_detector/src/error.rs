//! Top-level error type.

use crate::analysis::AnalysisError;
use crate::config::ConfigError;
use crate::diff::DiffError;
use crate::marker::MarkerError;
use crate::parsers::ParseError;
use crate::runner::RunError;
use crate::trace::TraceError;
use crate::waiter::WaitError;
use thiserror::Error;

/// Any failure that aborts an invocation.
#[derive(Debug, Error)]
pub enum FlakeError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error("malformed report: {0}")]
    MalformedReport(#[from] ParseError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Wait(#[from] WaitError),
    #[error("runner: {0}")]
    Runner(#[from] RunError),
    #[error("marker: {0}")]
    Marker(#[from] MarkerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlakeError>;
