#![allow(clippy::print_stdout)]

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

mod analysis;
mod config;
mod diff;
mod error;
mod marker;
mod normalize;
mod parsers;
mod pipeline;
mod ranges;
mod runner;
mod trace;
mod waiter;

use config::{Cli, Settings};
use error::Result;

/// Exit status when the test execution reported failures.
const EXIT_TESTS_FAILED: u8 = 1;
/// Exit status when the engine aborted.
const EXIT_ERROR: u8 = 2;

/// Logs go to stderr so stdout carries only the verdict.
fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

async fn run(cli: &Cli) -> Result<bool> {
    let settings = Settings::resolve(cli)?;
    info!(
        "[main] {:?} mode on {} (tests in {})",
        settings.mode,
        settings.repo_dir.display(),
        settings.test_dir.display()
    );

    let outcome = pipeline::run(&settings).await?;
    let json = serde_json::to_string_pretty(&outcome.verdict).map_err(std::io::Error::other)?;

    match &settings.output {
        Some(path) => tokio::fs::write(path, format!("{json}\n")).await?,
        None => println!("{json}"),
    }
    info!("[main] {} flaky test(s) found", outcome.verdict.total());

    if settings.dry_run {
        info!("[main] dry run, test files left untouched");
    } else if !outcome.verdict.is_empty() {
        let summary =
            marker::apply_verdict(&outcome.verdict, &settings.test_dir, &settings.marker)?;
        info!(
            "[main] marked {} test(s) in {} file(s)",
            summary.tests_marked, summary.files_changed
        );
        if !summary.skipped.is_empty() {
            warn!(
                "[main] {} file(s) left unmarked due to syntax errors",
                summary.skipped.len()
            );
        }
    }

    Ok(outcome.tests_failed)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    match runner::interruptible(run(&cli)).await {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => ExitCode::from(EXIT_TESTS_FAILED),
        Err(e) => {
            error!("{e}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}
