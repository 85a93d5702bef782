//! Test file discovery.

use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

/// All JS/TS files under `test_dir`, honoring gitignore, sorted.
pub fn discover_test_files(test_dir: &Path) -> Vec<PathBuf> {
    let walker = WalkBuilder::new(test_dir)
        .hidden(false)
        .git_ignore(true)
        .build();

    let mut files: Vec<PathBuf> = walker
        .flatten()
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .map(ignore::DirEntry::into_path)
        .filter(|path| is_script_file(path) && !in_node_modules(path))
        .collect();
    files.sort();
    files
}

/// Check if a path has a JS/TS extension.
pub fn is_script_file(path: &Path) -> bool {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    matches!(
        ext,
        "ts" | "tsx" | "js" | "jsx" | "mts" | "mjs" | "cts" | "cjs"
    )
}

fn in_node_modules(path: &Path) -> bool {
    path.components().any(|c| c.as_os_str() == "node_modules")
}
