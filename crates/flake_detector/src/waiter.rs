//! Waits for artifacts written by the test process.
//!
//! The artifact's parent directory is watched with notify-rs; every event
//! touching the artifact wakes the waiter, which re-reads the file and tests
//! the readiness predicate. There is no polling loop.

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Errors that can occur while waiting for an artifact.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("{} not ready after {elapsed:?}", path.display())]
    ResultTimeout { path: PathBuf, elapsed: Duration },
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes read from the end of an appended artifact when looking for its
/// sentinel.
const TAIL_WINDOW: u64 = 4096;

/// When an artifact counts as complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyPredicate {
    /// Non-trivial JSON; arrays must hold at least `min_entries` reports.
    JsonReports { min_entries: usize },
    /// The last non-empty line equals the token.
    Sentinel(String),
}

impl ReadyPredicate {
    pub fn is_ready(&self, content: &str) -> bool {
        match self {
            Self::JsonReports { min_entries } => {
                let Ok(value) = serde_json::from_str::<serde_json::Value>(content) else {
                    return false;
                };
                match value {
                    serde_json::Value::Array(runs) => runs.len() >= (*min_entries).max(1),
                    serde_json::Value::Object(map) => !map.is_empty() && *min_entries <= 1,
                    _ => false,
                }
            }
            Self::Sentinel(token) => content
                .lines()
                .map(str::trim)
                .rfind(|line| !line.is_empty())
                .is_some_and(|line| line == token),
        }
    }
}

/// Wait until `path` satisfies `predicate`, returning its content.
///
/// The watch is installed before the first check so a write landing between
/// the two is not lost.
pub async fn wait(
    path: &Path,
    predicate: &ReadyPredicate,
    timeout: Duration,
) -> Result<String, WaitError> {
    wait_inner(path, predicate, timeout, None).await
}

/// Like [`wait`], but content identical to `stale` never counts as ready.
pub async fn wait_for_update(
    path: &Path,
    predicate: &ReadyPredicate,
    timeout: Duration,
    stale: &str,
) -> Result<String, WaitError> {
    wait_inner(path, predicate, timeout, Some(blake3::hash(stale.as_bytes()))).await
}

async fn wait_inner(
    path: &Path,
    predicate: &ReadyPredicate,
    timeout: Duration,
    mut last_hash: Option<blake3::Hash>,
) -> Result<String, WaitError> {
    let start = Instant::now();
    let deadline = start + timeout;
    let watch_dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path.file_name().map(std::ffi::OsStr::to_os_string);

    // Capacity 1: a pending wake already covers any later event.
    let (tx, mut rx) = mpsc::channel::<()>(1);
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                if event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(std::ffi::OsStr::to_os_string) == file_name)
                {
                    let _ = tx.try_send(());
                }
            }
        },
        Config::default(),
    )?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

    loop {
        if let Some(content) = check(path, predicate, &mut last_hash).await? {
            debug!(
                "[waiter] {} ready after {}ms",
                path.display(),
                start.elapsed().as_millis()
            );
            return Ok(content);
        }

        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(())) => {}
            Ok(None) | Err(_) => break,
        }
    }

    // Last look in case the final write raced the deadline.
    if let Some(content) = check(path, predicate, &mut last_hash).await? {
        return Ok(content);
    }

    Err(WaitError::ResultTimeout {
        path: path.to_path_buf(),
        elapsed: start.elapsed(),
    })
}

/// Read the artifact and test it, unless its content is unchanged since the
/// previous check.
///
/// A sentinel only ever ends the artifact, so while the writer appends only the
/// tail is read; the full content is loaded once, when it is ready.
async fn check(
    path: &Path,
    predicate: &ReadyPredicate,
    last_hash: &mut Option<blake3::Hash>,
) -> Result<Option<String>, WaitError> {
    let read = match predicate {
        ReadyPredicate::Sentinel(token) => {
            read_tail(path, TAIL_WINDOW + token.len() as u64).await
        }
        ReadyPredicate::JsonReports { .. } => tokio::fs::read(path).await,
    };
    let bytes = match read {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let hash = blake3::hash(&bytes);
    if *last_hash == Some(hash) {
        return Ok(None);
    }
    *last_hash = Some(hash);

    // A torn write may split a UTF-8 sequence; the next event retries.
    let Ok(content) = String::from_utf8(bytes) else {
        return Ok(None);
    };
    if !predicate.is_ready(&content) {
        return Ok(None);
    }

    match predicate {
        ReadyPredicate::JsonReports { .. } => Ok(Some(content)),
        ReadyPredicate::Sentinel(_) => match tokio::fs::read(path).await {
            Ok(full) => Ok(String::from_utf8(full).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        },
    }
}

/// The last complete lines within `window` bytes of the end of `path`.
///
/// When the window starts mid-file, the partial first line is dropped so it
/// can never pass for the sentinel.
async fn read_tail(path: &Path, window: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let offset = len.saturating_sub(window);
    file.seek(SeekFrom::Start(offset)).await?;

    let mut tail = Vec::new();
    file.read_to_end(&mut tail).await?;
    if offset == 0 {
        return Ok(tail);
    }
    Ok(match tail.iter().position(|&b| b == b'\n') {
        Some(newline) => tail.split_off(newline + 1),
        None => Vec::new(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn json_reports_requires_entries() {
        let p = ReadyPredicate::JsonReports { min_entries: 2 };
        assert!(!p.is_ready(""));
        assert!(!p.is_ready("{}"));
        assert!(!p.is_ready("[{\"passes\": []}"));
        assert!(!p.is_ready("[{}]"));
        assert!(p.is_ready("[{}, {}]"));
        assert!(p.is_ready("[{}, {}, {}]"));
    }

    #[test]
    fn json_reports_rejects_trivial_content() {
        let p = ReadyPredicate::JsonReports { min_entries: 0 };
        assert!(!p.is_ready("[]"));
        assert!(!p.is_ready("{}"));
        assert!(!p.is_ready("null"));
        assert!(p.is_ready("{\"stats\": {}}"));
    }

    #[test]
    fn sentinel_matches_last_non_empty_line() {
        let p = ReadyPredicate::Sentinel("testingended".to_string());
        assert!(p.is_ready("testsplit\nT1\ntestingended\n\n"));
        assert!(p.is_ready("testingended\r\n"));
        assert!(!p.is_ready("testsplit\nT1\n"));
        assert!(!p.is_ready("testingended\ntestsplit\n"));
        assert!(!p.is_ready(""));
    }

    #[tokio::test]
    async fn wait_returns_content_already_present() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.log");
        fs::write(&path, "testsplit\nT\ntestingended\n").unwrap();

        let content = wait(
            &path,
            &ReadyPredicate::Sentinel("testingended".to_string()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(content.starts_with("testsplit"));
    }

    #[tokio::test]
    async fn wait_wakes_on_later_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        fs::write(&path, "[{\"failures\": []}]").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::write(&writer_path, "[{\"failures\": []}, {\"failures\": []}]")
                .await
                .unwrap();
        });

        let content = wait(
            &path,
            &ReadyPredicate::JsonReports { min_entries: 2 },
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        writer.await.unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&content)
                .unwrap()
                .as_array()
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn wait_sees_file_created_after_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("late.log");

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::write(&writer_path, "done\n").await.unwrap();
        });

        let content = wait(
            &path,
            &ReadyPredicate::Sentinel("done".to_string()),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(content, "done\n");
    }

    #[tokio::test]
    async fn wait_for_update_skips_stale_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        let stale = "[{\"passes\": [{\"title\": \"t\"}]}]";
        fs::write(&path, stale).unwrap();
        let predicate = ReadyPredicate::JsonReports { min_entries: 1 };

        let err = wait_for_update(&path, &predicate, Duration::from_millis(150), stale)
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::ResultTimeout { .. }));

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::write(&writer_path, "[{\"passes\": []}]").await.unwrap();
        });
        let fresh = wait_for_update(&path, &predicate, Duration::from_secs(10), stale)
            .await
            .unwrap();
        assert_eq!(fresh, "[{\"passes\": []}]");
    }

    #[tokio::test]
    async fn wait_times_out_on_incomplete_artifact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.log");
        fs::write(&path, "testsplit\nT\n").unwrap();

        let err = wait(
            &path,
            &ReadyPredicate::Sentinel("testingended".to_string()),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        match err {
            WaitError::ResultTimeout { path: p, elapsed } => {
                assert_eq!(p, path);
                assert!(elapsed >= Duration::from_millis(200));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn sentinel_wait_returns_whole_large_trace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let records: String = (1..=2000)
            .map(|i| format!("return,/repo/src/a.js,f{i},{i},{i}\n"))
            .collect();
        let full = format!("testsplit\nT\n{records}testingended\n");
        fs::write(&path, &full).unwrap();

        let content = wait(
            &path,
            &ReadyPredicate::Sentinel("testingended".to_string()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(content, full);
    }

    #[tokio::test]
    async fn read_tail_drops_partial_first_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.log");
        fs::write(&path, format!("{}testingended", "x".repeat(100))).unwrap();
        assert!(read_tail(&path, 20).await.unwrap().is_empty());

        fs::write(&path, "abc\ndef\ntestingended\n").unwrap();
        assert_eq!(read_tail(&path, 16).await.unwrap(), b"testingended\n");
        assert_eq!(
            read_tail(&path, 1000).await.unwrap(),
            b"abc\ndef\ntestingended\n"
        );
    }
}
