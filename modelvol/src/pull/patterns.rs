//! Post-fetch exclusion filtering.
//!
//! Users may supply gitignore-style patterns naming files that must not
//! survive a fetch. Patterns are validated at compile time: absolute paths
//! and parent-directory references are rejected outright so a pattern can
//! never reach outside the target directory.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Compiled gitignore-style matcher over user exclusion patterns.
#[derive(Debug)]
pub struct FilePatternMatcher {
    matcher: Gitignore,
    patterns: Vec<String>,
}

impl FilePatternMatcher {
    pub fn new(patterns: &[String]) -> Result<Self> {
        for pattern in patterns {
            if pattern.starts_with('/') && pattern.len() > 1 {
                return Err(Error::InvalidArgument(format!(
                    "absolute path patterns are not allowed: {pattern}"
                )));
            }
            if pattern.contains("..") {
                return Err(Error::InvalidArgument(format!(
                    "parent directory reference is not allowed: {pattern}"
                )));
            }
        }

        let mut builder = GitignoreBuilder::new("");
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .map_err(|e| Error::InvalidArgument(format!("invalid pattern {pattern}: {e}")))?;
        }
        let matcher = builder
            .build()
            .map_err(|e| Error::InvalidArgument(format!("compile patterns: {e}")))?;

        Ok(Self {
            matcher,
            patterns: patterns.to_vec(),
        })
    }

    /// Whether `path` (relative to the fetch target) matches an exclusion
    /// pattern, directly or through an excluded parent directory.
    pub fn is_match(&self, path: &Path, is_dir: bool) -> bool {
        self.matcher
            .matched_path_or_any_parents(path, is_dir)
            .is_ignore()
    }

    /// Whether any patterns are defined at all.
    pub fn excludes(&self) -> bool {
        !self.patterns.is_empty()
    }
}

/// Remove files under `target_dir` matching the exclusion patterns, then
/// sweep away directories left empty, deepest first.
///
/// Returns the removed file paths relative to `target_dir`, sorted.
pub fn filter_files(target_dir: &Path, matcher: &FilePatternMatcher) -> Result<Vec<PathBuf>> {
    let mut excluded = Vec::new();

    for entry in walkdir::WalkDir::new(target_dir) {
        let entry = entry
            .map_err(|e| Error::Internal(format!("walk {}: {e}", target_dir.display())))?;
        if entry.path() == target_dir {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(target_dir)
            .map_err(|e| Error::Internal(format!("relativize {}: {e}", entry.path().display())))?;

        if entry.file_type().is_dir() {
            continue;
        }
        if matcher.is_match(rel, false) {
            info!("excluding file: {}", rel.display());
            std::fs::remove_file(entry.path()).map_err(|e| {
                Error::Internal(format!("remove excluded file {}: {e}", rel.display()))
            })?;
            excluded.push(rel.to_path_buf());
        }
    }

    remove_empty_directories(target_dir);

    excluded.sort();
    info!("excluded {} file(s) matching patterns", excluded.len());
    Ok(excluded)
}

fn remove_empty_directories(target_dir: &Path) {
    let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(target_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir() && entry.path() != target_dir)
        .map(|entry| entry.into_path())
        .collect();

    // Deepest first, so a parent emptied by its child's removal goes too.
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));

    for dir in dirs {
        // remove_dir refuses non-empty directories, which is exactly the
        // filter needed here.
        match std::fs::remove_dir(&dir) {
            Ok(()) => info!("removed empty directory: {}", dir.display()),
            Err(e) if e.raw_os_error() == Some(nix::libc::ENOTEMPTY) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("remove empty directory {}: {e}", dir.display()),
        }
    }
}
