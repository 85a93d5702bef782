//! Orchestrates one invocation in diff mode or rerun mode.
//!
//! Artifacts only cross the process boundary here. Everything downstream of
//! the waiter works on parsed values.

use crate::analysis::{classify_reruns, join_failures, FlakyVerdict, RerunHistory};
use crate::config::{Mode, Settings};
use crate::diff::git::collect_patches;
use crate::diff::{DiffSnapshot, FilePatch};
use crate::error::Result;
use crate::parsers::mocha::{self, ExecutionReport};
use crate::parsers::ParseError;
use crate::runner::{self, SuiteRun};
use crate::trace::{compile, parse_log, END_SENTINEL};
use crate::waiter::{self, ReadyPredicate, WaitError};
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long the trace may lag behind the test process exiting.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub verdict: FlakyVerdict,
    /// The test execution reported at least one failure.
    pub tests_failed: bool,
}

pub async fn run(settings: &Settings) -> Result<Outcome> {
    match settings.mode {
        Mode::Diff => run_diff_mode(settings).await,
        Mode::Rerun => run_rerun_mode(settings).await,
    }
}

/// Run the instrumented suite once and report failures that did not touch
/// changed code.
pub async fn run_diff_mode(settings: &Settings) -> Result<Outcome> {
    // Before the suite starts, so both see the same tree.
    let snapshot = diff_snapshot(settings)?;
    if snapshot.is_empty() {
        warn!("[pipeline] no changes found; every covered failure will be reported");
    } else {
        info!("[pipeline] diff covers {} file(s)", snapshot.len());
    }
    for file in snapshot.iter() {
        if file.whole_file {
            debug!("[diff] {}: whole file", file.path);
        } else {
            debug!("[diff] {}: {}", file.path, file.ranges);
        }
    }

    reset_artifacts(settings, true).await?;
    let results_path = settings.results_path();
    let trace_path = settings.trace_path();
    let suite = SuiteRun {
        command: &settings.test_command,
        repo_dir: &settings.repo_dir,
        test_dir: &settings.test_dir,
        results_path: &results_path,
        trace_path: Some(&trace_path),
        order: &settings.order,
        run_index: 1,
    };

    let (status, trace_text) =
        run_instrumented(&suite, &trace_path, settings.trace_timeout).await?;
    let reports = read_reports(settings, 1).await?;
    let report = reports.last().ok_or(ParseError::NoRuns)?;
    check_status(status, report);

    let verdict = diff_verdict(
        &trace_text,
        report,
        &snapshot,
        &settings.repo_dir,
        &settings.test_dir,
    )?;
    Ok(Outcome {
        verdict,
        tests_failed: report.has_failures(),
    })
}

/// Run the suite `settings.runs` times and report tests whose outcome varied.
pub async fn run_rerun_mode(settings: &Settings) -> Result<Outcome> {
    reset_artifacts(settings, false).await?;
    let results_path = settings.results_path();
    let mut history = RerunHistory::new();

    for run_index in 1..=settings.runs {
        let suite = SuiteRun {
            command: &settings.test_command,
            repo_dir: &settings.repo_dir,
            test_dir: &settings.test_dir,
            results_path: &results_path,
            trace_path: None,
            order: &settings.order,
            run_index,
        };
        let status = runner::finish(suite.spawn()?).await?;

        let report = read_reports(settings, run_index)
            .await?
            .into_iter()
            .nth(run_index - 1)
            .ok_or(ParseError::NoRuns)?;
        check_status(status, &report);
        info!(
            "[pipeline] run {run_index}/{}: {} passed, {} failed, {} pending",
            settings.runs,
            report.passes.len(),
            report.failures.len(),
            report.pending.len()
        );
        history.push(report);
    }

    let verdict = classify_reruns(&history)?;
    Ok(Outcome {
        verdict,
        tests_failed: history.has_failures(),
    })
}

/// Compile the trace and join it with one run's failures.
pub fn diff_verdict(
    trace_text: &str,
    report: &ExecutionReport,
    snapshot: &DiffSnapshot,
    repo_dir: &Path,
    test_dir: &Path,
) -> Result<FlakyVerdict> {
    let traces = parse_log(trace_text)?;
    let coverage = compile(&traces, repo_dir, test_dir);
    if coverage.is_empty() && !report.failures.is_empty() {
        warn!("[pipeline] trace holds no tests; failures cannot be correlated");
    }
    debug!("[pipeline] coverage for {} test(s)", coverage.len());
    Ok(join_failures(report, &coverage, snapshot))
}

fn diff_snapshot(settings: &Settings) -> Result<DiffSnapshot> {
    let patches = collect_patches(&settings.repo_dir, &settings.diff_source)?;
    let patches = without_artifacts(patches, &settings.repo_dir, &settings.artifacts_dir);
    Ok(DiffSnapshot::build(&patches, &settings.repo_dir)?)
}

/// Drop patches for files inside the artifacts directory, which would
/// otherwise show up as untracked changes.
fn without_artifacts(
    patches: Vec<FilePatch>,
    repo_dir: &Path,
    artifacts_dir: &Path,
) -> Vec<FilePatch> {
    let Ok(prefix) = artifacts_dir.strip_prefix(repo_dir) else {
        return patches;
    };
    if prefix.as_os_str().is_empty() {
        return patches;
    }
    patches
        .into_iter()
        .filter(|p| !Path::new(&p.path).starts_with(prefix))
        .collect()
}

async fn reset_artifacts(settings: &Settings, with_trace: bool) -> Result<()> {
    tokio::fs::create_dir_all(&settings.artifacts_dir).await?;
    tokio::fs::write(settings.results_path(), "").await?;
    if with_trace {
        tokio::fs::write(settings.trace_path(), "").await?;
    }
    debug!("[pipeline] artifacts reset in {}", settings.artifacts_dir.display());
    Ok(())
}

/// Run the suite while waiting for its trace to complete.
async fn run_instrumented(
    suite: &SuiteRun<'_>,
    trace_path: &Path,
    timeout: Duration,
) -> Result<(ExitStatus, String)> {
    let start = Instant::now();
    let sentinel = ReadyPredicate::Sentinel(END_SENTINEL.to_string());
    let exit = runner::finish(suite.spawn()?);
    let trace = waiter::wait(trace_path, &sentinel, timeout);
    tokio::pin!(exit);
    tokio::pin!(trace);

    tokio::select! {
        content = &mut trace => {
            let content = content?;
            let status = exit.await?;
            Ok((status, content))
        }
        status = &mut exit => {
            let status = status?;
            match tokio::time::timeout(EXIT_GRACE, &mut trace).await {
                Ok(content) => Ok((status, content?)),
                Err(_) => Err(WaitError::ResultTimeout {
                    path: trace_path.to_path_buf(),
                    elapsed: start.elapsed(),
                }
                .into()),
            }
        }
    }
}

/// Wait for at least `min_entries` reports and parse them.
///
/// Content that is valid JSON but does not parse as reports gets one more
/// chance: the artifact may still be mid-rewrite.
async fn read_reports(settings: &Settings, min_entries: usize) -> Result<Vec<ExecutionReport>> {
    let path = settings.results_path();
    let predicate = ReadyPredicate::JsonReports { min_entries };
    let content = waiter::wait(&path, &predicate, settings.results_timeout).await?;

    match mocha::parse(&content, &settings.test_dir) {
        Ok(reports) => Ok(reports),
        Err(first) => {
            warn!("[pipeline] results did not parse ({first}), waiting for a rewrite");
            let retry = waiter::wait_for_update(
                &path,
                &predicate,
                settings.results_retry_extension,
                &content,
            )
            .await;
            match retry {
                Ok(content) => Ok(mocha::parse(&content, &settings.test_dir)?),
                Err(WaitError::ResultTimeout { .. }) => Err(first.into()),
                Err(e) => Err(e.into()),
            }
        }
    }
}

fn check_status(status: ExitStatus, report: &ExecutionReport) {
    if !status.success() && !report.has_failures() {
        warn!("[pipeline] test command exited with {status} but reported no failures");
    }
    if let Some(stats) = &report.stats {
        if stats.failures as usize != report.failures.len() {
            warn!(
                "[pipeline] reporter counted {} failure(s) but listed {}",
                stats.failures,
                report.failures.len()
            );
        }
        if let Some(ms) = stats.duration {
            debug!("[pipeline] suite took {ms}ms");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::diff::git::DiffSource;
    use crate::marker::DEFAULT_MARKER;
    use crate::parsers::mocha::TestOutcome;
    use crate::runner::RunOrder;
    use std::fs;
    use std::process::Command;
    use tempfile::{tempdir, TempDir};

    fn settings(repo: &Path, test_dir: &Path, artifacts: &Path, command: &str, mode: Mode) -> Settings {
        Settings {
            repo_dir: repo.to_path_buf(),
            test_dir: test_dir.to_path_buf(),
            test_command: command.to_string(),
            mode,
            runs: 3,
            order: RunOrder::Standard,
            diff_source: DiffSource::WorkingTree,
            artifacts_dir: artifacts.to_path_buf(),
            trace_timeout: Duration::from_secs(20),
            results_timeout: Duration::from_secs(20),
            results_retry_extension: Duration::from_millis(200),
            marker: DEFAULT_MARKER.to_string(),
            dry_run: true,
            output: None,
        }
    }

    fn write_script(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("run.sh");
        fs::write(&path, body).unwrap();
        format!("sh {}", path.display())
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn numbered_lines(n: u32) -> String {
        (1..=n).map(|i| format!("line{i}\n")).collect()
    }

    #[test]
    fn diff_verdict_separates_regressions_from_flakes() {
        let snapshot = DiffSnapshot::build(
            &[FilePatch::new("a.js", vec!["@@ -10,3 +10,3 @@".to_string()])],
            Path::new("/repo"),
        )
        .unwrap();
        let trace = "\
testsplit
T1
/repo/test/a.test.js
return,/repo/a.js,f,10,11
testsplit
T2
/repo/test/a.test.js
return,/repo/a.js,g,50,52
testingended
";
        let outcome = |title: &str| TestOutcome {
            title: title.to_string(),
            file: "a.test.js".to_string(),
        };
        let report = ExecutionReport {
            failures: vec![outcome("T1"), outcome("T2")],
            ..ExecutionReport::default()
        };

        let verdict = diff_verdict(
            trace,
            &report,
            &snapshot,
            Path::new("/repo"),
            Path::new("/repo/test"),
        )
        .unwrap();
        assert_eq!(verdict.titles_for("a.test.js"), ["T2"]);
    }

    #[test]
    fn diff_verdict_rejects_malformed_trace() {
        let report = ExecutionReport::default();
        let err = diff_verdict(
            "testsplit\nT\nbogus,record\n",
            &report,
            &DiffSnapshot::default(),
            Path::new("/repo"),
            Path::new("/repo/test"),
        )
        .unwrap_err();
        assert!(matches!(err, crate::error::FlakeError::Trace(_)));
    }

    #[test]
    fn artifacts_inside_repo_are_not_changes() {
        let patches = vec![
            FilePatch::new("src/a.js", Vec::new()),
            FilePatch::new(".flake/results.json", Vec::new()),
        ];
        let kept = without_artifacts(patches, Path::new("/repo"), Path::new("/repo/.flake"));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].path, "src/a.js");

        let outside = vec![FilePatch::new("x.js", Vec::new())];
        let kept = without_artifacts(outside, Path::new("/repo"), Path::new("/tmp/f"));
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn rerun_mode_flags_varying_test() {
        let repo = tempdir().unwrap();
        let scripts = tempdir().unwrap();
        let artifacts = tempdir().unwrap();
        let test_dir = repo.path().join("test");
        fs::create_dir_all(&test_dir).unwrap();

        let command = write_script(
            &scripts,
            r#"steady='{"title":"steady","file":"a.test.js"}'
wobbly='{"title":"wobbly","file":"a.test.js"}'
pass="{\"passes\":[$steady,$wobbly],\"failures\":[],\"pending\":[]}"
fail="{\"passes\":[$steady],\"failures\":[$wobbly],\"pending\":[]}"
case "$FLAKE_RUN_INDEX" in
  1) printf '[%s]' "$pass" > "$FLAKE_RESULTS_PATH" ;;
  2) printf '[%s,%s]' "$pass" "$fail" > "$FLAKE_RESULTS_PATH"; exit 1 ;;
  *) printf '[%s,%s,%s]' "$pass" "$fail" "$pass" > "$FLAKE_RESULTS_PATH" ;;
esac
"#,
        );
        let s = settings(repo.path(), &test_dir, artifacts.path(), &command, Mode::Rerun);

        let outcome = run(&s).await.unwrap();
        assert!(outcome.tests_failed);
        assert_eq!(outcome.verdict.titles_for("a.test.js"), ["wobbly"]);
    }

    #[tokio::test]
    async fn rerun_mode_reports_missing_outcome() {
        let repo = tempdir().unwrap();
        let scripts = tempdir().unwrap();
        let artifacts = tempdir().unwrap();

        let command = write_script(
            &scripts,
            r#"one='{"passes":[{"title":"a","file":"a.test.js"},{"title":"b","file":"a.test.js"}]}'
two='{"passes":[{"title":"a","file":"a.test.js"}]}'
if [ "$FLAKE_RUN_INDEX" = 1 ]; then
  printf '[%s]' "$one" > "$FLAKE_RESULTS_PATH"
else
  printf '[%s,%s]' "$one" "$two" > "$FLAKE_RESULTS_PATH"
fi
"#,
        );
        let mut s = settings(repo.path(), repo.path(), artifacts.path(), &command, Mode::Rerun);
        s.runs = 2;

        let err = run(&s).await.unwrap_err();
        assert!(matches!(err, crate::error::FlakeError::Analysis(_)));
    }

    #[tokio::test]
    async fn diff_mode_end_to_end() {
        let repo = tempdir().unwrap();
        let scripts = tempdir().unwrap();
        let artifacts = tempdir().unwrap();
        let root = repo.path().canonicalize().unwrap();
        let test_dir = root.join("test");
        fs::create_dir_all(&test_dir).unwrap();

        git(&root, &["init", "-q"]);
        git(&root, &["config", "user.email", "dev@example.com"]);
        git(&root, &["config", "user.name", "Dev"]);
        fs::write(root.join("a.js"), numbered_lines(60)).unwrap();
        fs::write(
            test_dir.join("a.test.js"),
            "it('T1', () => {});\nit('T2', () => {});\n",
        )
        .unwrap();
        git(&root, &["add", "."]);
        git(&root, &["commit", "-q", "-m", "init"]);

        let changed = numbered_lines(60)
            .replace("line10\n", "changed10\n")
            .replace("line11\n", "changed11\n")
            .replace("line12\n", "changed12\n");
        fs::write(root.join("a.js"), changed).unwrap();

        let command = write_script(
            &scripts,
            r#"t="$FLAKE_TEST_DIR/a.test.js"
printf 'testsplit\nT1\n%s\nreturn,%s/a.js,f,10,11\ntestsplit\nT2\n%s\nreturn,%s/a.js,g,50,52\ntestingended\n' "$t" "$PWD" "$t" "$PWD" > "$FLAKE_TRACE_PATH"
printf '[{"passes":[],"failures":[{"title":"T1","file":"%s"},{"title":"T2","file":"%s"}],"pending":[]}]' "$t" "$t" > "$FLAKE_RESULTS_PATH"
exit 2
"#,
        );
        let s = settings(&root, &test_dir, artifacts.path(), &command, Mode::Diff);

        let outcome = run(&s).await.unwrap();
        assert!(outcome.tests_failed);
        assert_eq!(outcome.verdict.titles_for("a.test.js"), ["T2"]);
    }

    #[tokio::test]
    async fn diff_mode_times_out_without_trace() {
        let repo = tempdir().unwrap();
        let artifacts = tempdir().unwrap();
        let root = repo.path().canonicalize().unwrap();
        git(&root, &["init", "-q"]);
        git(&root, &["config", "user.email", "dev@example.com"]);
        git(&root, &["config", "user.name", "Dev"]);
        fs::write(root.join("a.js"), "x\n").unwrap();
        git(&root, &["add", "."]);
        git(&root, &["commit", "-q", "-m", "init"]);

        let mut s = settings(&root, &root, artifacts.path(), "true", Mode::Diff);
        s.trace_timeout = Duration::from_millis(300);

        let err = run(&s).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::FlakeError::Wait(WaitError::ResultTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn read_reports_retries_once_after_bad_content() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let s = settings(&root, &root, &root.join("artifacts"), "true", Mode::Rerun);
        fs::create_dir_all(&s.artifacts_dir).unwrap();
        let path = s.results_path();
        fs::write(&path, r#"[{"passes": [{"title": "t"}]}]"#).unwrap();

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tokio::fs::write(&writer_path, r#"[{"passes": [{"title": "t", "file": "a.test.js"}]}]"#)
                .await
                .unwrap();
        });

        let reports = read_reports(&s, 1).await.unwrap();
        assert_eq!(reports[0].passes[0].file, "a.test.js");
    }

    #[tokio::test]
    async fn read_reports_surfaces_first_parse_error() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let s = settings(&root, &root, &root.join("artifacts"), "true", Mode::Rerun);
        fs::create_dir_all(&s.artifacts_dir).unwrap();
        fs::write(s.results_path(), r#"[{"failures": [{"title": "t"}]}]"#).unwrap();

        let err = read_reports(&s, 1).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::FlakeError::MalformedReport(ParseError::MissingFile { run: 1, .. })
        ));
    }
}
