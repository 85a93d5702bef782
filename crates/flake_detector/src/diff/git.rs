//! Git diff collaborator.
//!
//! Shells out to the `git` binary and collects hunk headers per file, either
//! for the working tree against `HEAD` or between two revisions.

use super::{DiffError, FilePatch};
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Which changes make up the diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffSource {
    /// Staged, unstaged and untracked changes relative to `HEAD`.
    WorkingTree,
    /// `git diff <from> <to>`.
    Commits { from: String, to: String },
}

/// Collect raw per-file patches for `source`.
///
/// Paths are relative to `repo_dir` (`--relative`), so a test directory inside
/// a larger repository still lines up with trace paths.
pub fn collect_patches(repo_dir: &Path, source: &DiffSource) -> Result<Vec<FilePatch>, DiffError> {
    let mut patches = match source {
        DiffSource::WorkingTree => {
            let text = run_git(repo_dir, &diff_args(&["HEAD"]))?;
            parse_unified(&text)
        }
        DiffSource::Commits { from, to } => {
            let text = run_git(repo_dir, &diff_args(&[from.as_str(), to.as_str()]))?;
            parse_unified(&text)
        }
    };

    if *source == DiffSource::WorkingTree {
        let untracked = run_git(
            repo_dir,
            &[
                "-c",
                "core.quotepath=off",
                "ls-files",
                "-z",
                "--others",
                "--exclude-standard",
            ],
        )?;
        for path in untracked.split('\0').filter(|p| !p.is_empty()) {
            patches.push(FilePatch::new(path, Vec::new()));
        }
    }

    debug!("[diff] collected {} patched files", patches.len());
    Ok(patches)
}

fn diff_args<'a>(revs: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec![
        "-c",
        "core.quotepath=off",
        "diff",
        "--no-color",
        "--no-ext-diff",
        "--relative",
        "-U0",
    ];
    args.extend_from_slice(revs);
    args
}

fn run_git(repo_dir: &Path, args: &[&str]) -> Result<String, DiffError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| DiffError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DiffError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Split unified diff text into per-file hunk headers.
///
/// Deleted files are skipped: nothing can execute them any more. Patches
/// without hunks are kept only for new and binary files. Mode changes and
/// pure renames leave every line as it was.
pub fn parse_unified(text: &str) -> Vec<FilePatch> {
    let mut patches = Vec::new();
    let mut current: Option<PendingPatch> = None;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(done) = current.take() {
                done.finish(&mut patches);
            }
            current = Some(PendingPatch::from_diff_line(rest));
            continue;
        }
        let Some(patch) = current.as_mut() else {
            continue;
        };

        if line.starts_with("deleted file mode") {
            patch.deleted = true;
        } else if line.starts_with("new file mode") {
            patch.created = true;
        } else if line.starts_with("Binary files ") || line == "GIT binary patch" {
            patch.binary = true;
        } else if let Some(target) = line.strip_prefix("+++ ") {
            if target.trim() == "/dev/null" {
                patch.deleted = true;
            } else {
                patch.path = Some(strip_side_prefix(target, "b/"));
            }
        } else if line.starts_with("@@") {
            patch.headers.push(line.to_string());
        }
    }
    if let Some(done) = current {
        done.finish(&mut patches);
    }
    patches
}

struct PendingPatch {
    path: Option<String>,
    headers: Vec<String>,
    deleted: bool,
    created: bool,
    binary: bool,
}

impl PendingPatch {
    fn from_diff_line(rest: &str) -> Self {
        // `a/<path> b/<path>`; the new side is authoritative for renames.
        let split = if rest.ends_with('"') {
            rest.rfind(" \"b/")
        } else {
            rest.rfind(" b/")
        };
        let path = split.map(|idx| strip_side_prefix(&rest[idx + 1..], "b/"));
        Self {
            path,
            headers: Vec::new(),
            deleted: false,
            created: false,
            binary: false,
        }
    }

    fn finish(self, out: &mut Vec<FilePatch>) {
        if self.deleted {
            return;
        }
        if self.headers.is_empty() && !self.created && !self.binary {
            if let Some(path) = &self.path {
                debug!("[diff] {path}: metadata-only change, ignored");
            }
            return;
        }
        if let Some(path) = self.path {
            out.push(FilePatch::new(path, self.headers));
        }
    }
}

fn strip_side_prefix(raw: &str, prefix: &str) -> String {
    let path = unquote(raw.trim());
    match path.strip_prefix(prefix) {
        Some(stripped) => stripped.to_string(),
        None => path,
    }
}

/// Undo git's C-style quoting of unusual path names.
///
/// With `core.quotepath=off` only control characters, quotes and backslashes
/// force quoting, but octal escapes are decoded too so either setting works.
fn unquote(raw: &str) -> String {
    let Some(inner) = raw
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
    else {
        return raw.to_string();
    };

    let mut bytes = Vec::with_capacity(inner.len());
    let mut rest = inner.as_bytes();
    while let Some((&b, tail)) = rest.split_first() {
        rest = tail;
        if b != b'\\' {
            bytes.push(b);
            continue;
        }
        let Some((&esc, tail)) = rest.split_first() else {
            bytes.push(b'\\');
            break;
        };
        rest = tail;
        match esc {
            b'n' => bytes.push(b'\n'),
            b't' => bytes.push(b'\t'),
            b'r' => bytes.push(b'\r'),
            b'a' => bytes.push(0x07),
            b'b' => bytes.push(0x08),
            b'f' => bytes.push(0x0c),
            b'v' => bytes.push(0x0b),
            b'0'..=b'7' => {
                let mut value = u32::from(esc - b'0');
                for _ in 0..2 {
                    match rest.split_first() {
                        Some((&d @ b'0'..=b'7', tail)) => {
                            value = value * 8 + u32::from(d - b'0');
                            rest = tail;
                        }
                        _ => break,
                    }
                }
                bytes.push(u8::try_from(value).unwrap_or(u8::MAX));
            }
            other => bytes.push(other),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
