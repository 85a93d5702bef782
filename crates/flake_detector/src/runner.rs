//! Runs the operator's test command.
//!
//! The command is handed to `sh -c` in the repository directory. Everything
//! the reporter and instrumentation need travels through `FLAKE_*`
//! environment variables.

use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub const ENV_RESULTS_PATH: &str = "FLAKE_RESULTS_PATH";
pub const ENV_TRACE_PATH: &str = "FLAKE_TRACE_PATH";
pub const ENV_INSTRUMENT: &str = "FLAKE_INSTRUMENT";
pub const ENV_TEST_DIR: &str = "FLAKE_TEST_DIR";
pub const ENV_RUN_ORDER: &str = "FLAKE_RUN_ORDER";
pub const ENV_SHUFFLE_SEED: &str = "FLAKE_SHUFFLE_SEED";
pub const ENV_TEST_ORDER: &str = "FLAKE_TEST_ORDER";
pub const ENV_RUN_INDEX: &str = "FLAKE_RUN_INDEX";

/// Errors that can occur while running the test command.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("test command is empty")]
    EmptyCommand,
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("failed waiting for test command: {0}")]
    Wait(std::io::Error),
    #[error("interrupted")]
    Interrupted,
}

/// Suite order requested from the reporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOrder {
    Standard,
    Shuffled { seed: u64 },
    /// 1-based suite positions.
    Input(Vec<usize>),
}

impl RunOrder {
    /// Shuffled order with the given seed, or a random one.
    pub fn shuffled(seed: Option<u64>) -> Self {
        Self::Shuffled {
            seed: seed.unwrap_or_else(rand::random),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Shuffled { .. } => "shuffled",
            Self::Input(_) => "input",
        }
    }

    /// Seed for run `run_index`, so reruns do not repeat one permutation.
    pub fn seed_for_run(&self, run_index: usize) -> Option<u64> {
        match self {
            Self::Shuffled { seed } => {
                Some(seed.wrapping_add((run_index as u64).saturating_sub(1)))
            }
            _ => None,
        }
    }
}

/// Parse `2,1,3` into suite positions.
pub fn parse_positions(raw: &str) -> Result<Vec<usize>, String> {
    let positions = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<usize>() {
            Ok(0) | Err(_) => Err(format!("invalid suite position {s:?}")),
            Ok(n) => Ok(n),
        })
        .collect::<Result<Vec<_>, _>>()?;
    if positions.is_empty() {
        return Err("test order is empty".to_string());
    }
    Ok(positions)
}

/// One execution of the suite.
#[derive(Debug, Clone)]
pub struct SuiteRun<'a> {
    pub command: &'a str,
    pub repo_dir: &'a Path,
    pub test_dir: &'a Path,
    pub results_path: &'a Path,
    /// Present when the run is instrumented.
    pub trace_path: Option<&'a Path>,
    pub order: &'a RunOrder,
    pub run_index: usize,
}

impl SuiteRun<'_> {
    /// Environment passed to the child.
    pub fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            (ENV_RESULTS_PATH, self.results_path.display().to_string()),
            (ENV_TEST_DIR, self.test_dir.display().to_string()),
            (
                ENV_INSTRUMENT,
                if self.trace_path.is_some() { "1" } else { "0" }.to_string(),
            ),
            (ENV_RUN_ORDER, self.order.name().to_string()),
            (ENV_RUN_INDEX, self.run_index.to_string()),
        ];
        if let Some(trace) = self.trace_path {
            env.push((ENV_TRACE_PATH, trace.display().to_string()));
        }
        if let Some(seed) = self.order.seed_for_run(self.run_index) {
            env.push((ENV_SHUFFLE_SEED, seed.to_string()));
        }
        if let RunOrder::Input(positions) = self.order {
            let joined = positions
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(",");
            env.push((ENV_TEST_ORDER, joined));
        }
        env
    }

    /// Start the command. The child is killed if its handle is dropped.
    pub fn spawn(&self) -> Result<Child, RunError> {
        if self.command.trim().is_empty() {
            return Err(RunError::EmptyCommand);
        }

        if let Some(seed) = self.order.seed_for_run(self.run_index) {
            info!("[runner] run {} shuffled with seed {seed}", self.run_index);
        }
        debug!("[runner] run {}: sh -c {:?}", self.run_index, self.command);

        Command::new("sh")
            .arg("-c")
            .arg(self.command)
            .current_dir(self.repo_dir)
            .envs(self.env())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                command: self.command.to_string(),
                source,
            })
    }
}

/// Wait for the child to exit.
///
/// Dropping the returned future kills the child, which is how an interrupt
/// stops the suite.
pub async fn finish(mut child: Child) -> Result<ExitStatus, RunError> {
    child.wait().await.map_err(RunError::Wait)
}

/// Drive `work` to completion unless Ctrl-C arrives first.
///
/// The listener covers the whole invocation, including artifact waits between
/// runs. On interrupt `work` is dropped, killing any child it still owns.
pub async fn interruptible<F, T, E>(work: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<RunError>,
{
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("[runner] cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        out = work => out,
        () = interrupt => {
            warn!("[runner] interrupted, stopping test command");
            Err(RunError::Interrupted.into())
        }
    }
}
