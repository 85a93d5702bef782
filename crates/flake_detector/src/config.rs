//! Command line and `flake.toml` configuration.
//!
//! Command line values win over the file; the file wins over built-in
//! defaults. Everything is validated once, before any process is spawned.

use crate::diff::git::DiffSource;
use crate::marker::DEFAULT_MARKER;
use crate::normalize::stable_id;
use crate::runner::{parse_positions, RunOrder};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const CONFIG_FILE: &str = "flake.toml";

const DEFAULT_RUNS: usize = 2;
const DEFAULT_TRACE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_RESULTS_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RETRY_EXTENSION_SECS: u64 = 2;

#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Correlate failures with the diff
    Diff,
    /// Repeat the suite and compare outcomes
    Rerun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Standard,
    Shuffled,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffSourceKind {
    /// Uncommitted changes, including untracked files
    Worktree,
    /// Changes between two revisions
    Commits,
}

/// Flaky test detector
#[derive(Debug, Parser)]
#[command(name = "flake_detector", version, about)]
pub struct Cli {
    /// Repository to analyze
    pub repo_dir: PathBuf,

    /// Directory holding the test files
    pub test_dir: PathBuf,

    /// Shell command that runs the suite
    #[arg(long, env = "FLAKE_TEST_COMMAND")]
    pub test_command: Option<String>,

    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Number of suite runs in rerun mode
    #[arg(long)]
    pub runs: Option<usize>,

    #[arg(long, value_enum)]
    pub order: Option<OrderKind>,

    /// Suite positions for input order, e.g. 2,1,3
    #[arg(long)]
    pub test_order: Option<String>,

    /// Shuffle seed (random when omitted)
    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, value_enum)]
    pub diff_source: Option<DiffSourceKind>,

    /// Base revision for commit diffs
    #[arg(long)]
    pub from: Option<String>,

    /// Target revision for commit diffs
    #[arg(long)]
    pub to: Option<String>,

    /// Config file (default: <REPO_DIR>/flake.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory for the results and trace artifacts
    #[arg(long)]
    pub artifacts_dir: Option<PathBuf>,

    /// Seconds to wait for the trace artifact
    #[arg(long)]
    pub trace_timeout: Option<u64>,

    /// Seconds to wait for the results artifact
    #[arg(long)]
    pub results_timeout: Option<u64>,

    /// Compute the verdict without annotating test files
    #[arg(long)]
    pub dry_run: bool,

    /// Write the verdict as JSON to this path
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Contents of `flake.toml`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub test_command: Option<String>,
    pub mode: Option<Mode>,
    pub runs: Option<usize>,
    pub order: Option<OrderKind>,
    pub test_order: Option<Vec<usize>>,
    pub seed: Option<u64>,
    pub diff_source: Option<DiffSourceKind>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub artifacts_dir: Option<PathBuf>,
    pub trace_timeout_secs: Option<u64>,
    pub results_timeout_secs: Option<u64>,
    pub results_retry_extension_secs: Option<u64>,
    pub marker: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| ConfigError(format!("{}: {e}", path.display())))
    }
}

/// Validated settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub repo_dir: PathBuf,
    pub test_dir: PathBuf,
    pub test_command: String,
    pub mode: Mode,
    pub runs: usize,
    pub order: RunOrder,
    pub diff_source: DiffSource,
    pub artifacts_dir: PathBuf,
    pub trace_timeout: Duration,
    pub results_timeout: Duration,
    pub results_retry_extension: Duration,
    pub marker: String,
    pub dry_run: bool,
    pub output: Option<PathBuf>,
}

impl Settings {
    /// Resolve settings from the command line and the config file it
    /// points at, if any.
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let repo_dir = canonical_dir(&cli.repo_dir, "repository")?;
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => {
                let default = repo_dir.join(CONFIG_FILE);
                if default.is_file() {
                    FileConfig::load(&default)?
                } else {
                    FileConfig::default()
                }
            }
        };
        Self::merge(cli, file, repo_dir)
    }

    fn merge(cli: &Cli, file: FileConfig, repo_dir: PathBuf) -> Result<Self, ConfigError> {
        let test_dir = canonical_dir(&cli.test_dir, "test")?;

        let test_command = cli
            .test_command
            .clone()
            .or(file.test_command)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                ConfigError("a test command is required (--test-command or test_command)".into())
            })?;

        let mode = cli.mode.or(file.mode).unwrap_or(Mode::Diff);

        let runs = cli.runs.or(file.runs).unwrap_or(DEFAULT_RUNS);
        if mode == Mode::Rerun {
            if runs < 2 {
                return Err(ConfigError(format!(
                    "rerun mode needs at least 2 runs, got {runs}"
                )));
            }
            if runs < 3 {
                warn!("[config] only {runs} runs, intermittent failures will mostly go unseen");
            }
        }

        let order = match cli.order.or(file.order).unwrap_or(OrderKind::Standard) {
            OrderKind::Standard => RunOrder::Standard,
            OrderKind::Shuffled => RunOrder::shuffled(cli.seed.or(file.seed)),
            OrderKind::Input => {
                let positions = match (&cli.test_order, file.test_order) {
                    (Some(raw), _) => parse_positions(raw).map_err(ConfigError)?,
                    (None, Some(list)) if !list.is_empty() && !list.contains(&0) => list,
                    _ => {
                        return Err(ConfigError(
                            "input order needs non-empty 1-based positions (--test-order)".into(),
                        ))
                    }
                };
                RunOrder::Input(positions)
            }
        };

        let diff_source = match cli.diff_source.or(file.diff_source) {
            Some(DiffSourceKind::Commits) => DiffSource::Commits {
                from: cli.from.clone().or(file.from).unwrap_or_else(|| "HEAD~1".into()),
                to: cli.to.clone().or(file.to).unwrap_or_else(|| "HEAD".into()),
            },
            Some(DiffSourceKind::Worktree) | None => DiffSource::WorkingTree,
        };

        let artifacts_dir = match cli.artifacts_dir.clone().or(file.artifacts_dir) {
            Some(dir) if dir.is_relative() => repo_dir.join(dir),
            Some(dir) => dir,
            None => {
                std::env::temp_dir().join(format!("flake-{}", stable_id::for_repo(&repo_dir)))
            }
        };

        let secs = |flag: Option<u64>, from_file: Option<u64>, default: u64| {
            match flag.or(from_file).unwrap_or(default) {
                0 => Err(ConfigError("timeouts must be positive".into())),
                n => Ok(Duration::from_secs(n)),
            }
        };
        let trace_timeout = secs(
            cli.trace_timeout,
            file.trace_timeout_secs,
            DEFAULT_TRACE_TIMEOUT_SECS,
        )?;
        let results_timeout = secs(
            cli.results_timeout,
            file.results_timeout_secs,
            DEFAULT_RESULTS_TIMEOUT_SECS,
        )?;

        let marker = match file.marker {
            Some(marker) => line_comment(&marker)?,
            None => DEFAULT_MARKER.to_string(),
        };

        Ok(Self {
            test_command,
            mode,
            runs,
            order,
            diff_source,
            artifacts_dir,
            trace_timeout,
            results_timeout,
            results_retry_extension: Duration::from_secs(
                file.results_retry_extension_secs
                    .unwrap_or(DEFAULT_RETRY_EXTENSION_SECS),
            ),
            marker,
            dry_run: cli.dry_run,
            output: cli.output.clone(),
            repo_dir,
            test_dir,
        })
    }

    pub fn results_path(&self) -> PathBuf {
        self.artifacts_dir.join("results.json")
    }

    pub fn trace_path(&self) -> PathBuf {
        self.artifacts_dir.join("trace.log")
    }
}

/// The marker is inserted into test sources, so it must be a single `//`
/// comment line that leaves them parseable.
fn line_comment(marker: &str) -> Result<String, ConfigError> {
    let trimmed = marker.trim();
    if !trimmed.starts_with("//") || trimmed.contains(['\n', '\r']) {
        return Err(ConfigError(format!(
            "marker must be a single // line comment, got {marker:?}"
        )));
    }
    Ok(trimmed.to_string())
}

fn canonical_dir(path: &Path, what: &str) -> Result<PathBuf, ConfigError> {
    let dir = path
        .canonicalize()
        .map_err(|e| ConfigError(format!("{what} directory {}: {e}", path.display())))?;
    if !dir.is_dir() {
        return Err(ConfigError(format!(
            "{what} directory {} is not a directory",
            path.display()
        )));
    }
    Ok(dir)
}
