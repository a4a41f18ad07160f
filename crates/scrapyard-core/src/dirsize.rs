//! Disk-usage accounting for repository mirrors and scraper data directories.
//!
//! Scraper-controlled code can produce arbitrarily deep trees, so the walk
//! uses an explicit work-stack instead of recursion. Entries are examined with
//! `symlink_metadata`: a symlink contributes its own link size and is never
//! followed.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Total size in bytes of all regular files and symlinks under `root`.
///
/// A non-existent path yields 0. Unreadable entries are skipped.
pub fn directory_size(root: impl AsRef<Path>) -> u64 {
    let root = root.as_ref();
    let Ok(meta) = fs::symlink_metadata(root) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }

    let mut total = 0u64;
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %dir.display(), "dirsize: skipping unreadable directory: {e}");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = fs::symlink_metadata(&path) else {
                continue;
            };
            if meta.is_dir() {
                stack.push(path);
            } else {
                total += meta.len();
            }
        }
    }

    total
}
