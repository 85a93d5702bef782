//! Path normalization utilities for cross-platform consistency.
//!
//! Every file key that crosses a module boundary is produced here, once:
//! source files become repository-relative forward-slash paths, test files
//! become keys relative to the test directory.

use std::path::{Component, Path, PathBuf};

/// Normalizes a path to use forward slashes only.
///
/// - Converts backslashes to forward slashes
/// - Collapses consecutive slashes
pub fn normalize_slashes(path: &str) -> String {
    let mut result = String::with_capacity(path.len());
    let mut last_was_slash = false;

    for c in path.chars() {
        let is_slash = c == '/' || c == '\\';
        if is_slash {
            if !last_was_slash {
                result.push('/');
            }
            last_was_slash = true;
        } else {
            result.push(c);
            last_was_slash = false;
        }
    }
    result
}

/// Lexically resolves `.` and `..` components without touching the filesystem.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Converts a path reported by a collaborator into a repository-relative key.
///
/// Absolute paths under `repo_root` are stripped of the root; when the raw
/// path does not sit under the root lexically, its canonical form is tried so
/// that symlinked checkouts still line up. Paths outside the repository keep
/// their (normalized) absolute form and simply never match a diff entry.
pub fn repo_relative(raw: &str, repo_root: &Path) -> String {
    let cleaned = clean(Path::new(&normalize_slashes(raw.trim())));

    if cleaned.is_relative() {
        return to_key(&cleaned);
    }
    if let Ok(rel) = cleaned.strip_prefix(repo_root) {
        return to_key(rel);
    }
    if let Ok(canonical) = cleaned.canonicalize() {
        if let Ok(rel) = canonical.strip_prefix(repo_root) {
            return to_key(rel);
        }
    }
    to_key(&cleaned)
}

/// Converts a test file path into the key used to group verdicts.
///
/// - Absolute paths under `test_dir` become relative to it
/// - Relative paths are taken as already relative to `test_dir`
/// - Anything else falls back to the file name
pub fn test_file_key(raw: &str, test_dir: &Path) -> String {
    let cleaned = clean(Path::new(&normalize_slashes(raw.trim())));

    if cleaned.is_relative() {
        return to_key(&cleaned);
    }
    if let Ok(rel) = cleaned.strip_prefix(test_dir) {
        return to_key(rel);
    }
    cleaned
        .file_name()
        .map_or_else(|| to_key(&cleaned), |name| name.to_string_lossy().into_owned())
}

fn to_key(path: &Path) -> String {
    normalize_slashes(&path.to_string_lossy())
}
