//! Stable ID computation using BLAKE3.
//!
//! Derives a deterministic identifier for a repository so that its default
//! artifacts directory is the same across invocations without living inside
//! the working tree (where it would show up as an untracked change).

use std::path::Path;

/// Computes a stable ID for a repository root.
///
/// The ID is the BLAKE3 hash of the root's path, truncated to the first
/// 16 lowercase hexadecimal characters.
pub fn for_repo(repo_root: &Path) -> String {
    let input = repo_root.to_string_lossy();
    let hash = blake3::hash(input.as_bytes());
    let hex = hash.to_hex();
    hex[..16].to_lowercase()
}
