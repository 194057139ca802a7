//! Idempotent file staging into the datapool
//!
//! Raw `*.jsonl` data is merged flat into a destination directory: the path
//! of each file relative to the source root becomes its file name, joined with
//! `__`. A destination file whose SHA-256 matches the source is left alone;
//! one with different content is a clash and is never overwritten.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// How files are placed into the datapool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    /// Byte copy
    #[default]
    Copy,
    /// Hard link, falling back to a copy across filesystems
    Link,
}

/// Counters of one merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Files copied (or that would be, in dry-run mode)
    pub copied: usize,
    /// Files already present with identical content
    pub skipped: usize,
    /// Destination files that exist with different content
    pub clashes: Vec<PathBuf>,
}

/// Hex SHA-256 of a file's content
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Flat file name for a path relative to the merge source
pub fn flat_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("__")
}

fn is_jsonl(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("jsonl")
}

/// Source files of a merge with their flat destinations, sorted by source path
pub fn plan_jsonl_merge(source: &Path, destination: &Path) -> io::Result<Vec<(PathBuf, PathBuf)>> {
    let mut plan = Vec::new();
    for entry in WalkDir::new(source).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() || !is_jsonl(entry.path()) {
            continue;
        }
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        plan.push((entry.path().to_path_buf(), destination.join(flat_name(relative))));
    }
    Ok(plan)
}

/// Merge all `*.jsonl` files under `source` flat into `destination`
pub fn merge_jsonl(source: &Path, destination: &Path, mode: CopyMode, dry_run: bool) -> io::Result<MergeStats> {
    if !source.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("raw data source {} is not a directory", source.display()),
        ));
    }

    let mut stats = MergeStats::default();
    let plan = plan_jsonl_merge(source, destination)?;
    if !dry_run && !plan.is_empty() {
        fs::create_dir_all(destination)?;
    }

    for (src, dst) in plan {
        if dst.exists() {
            if sha256_file(&src)? == sha256_file(&dst)? {
                stats.skipped += 1;
            } else {
                warn!("Not overwriting {} with different content from {}", dst.display(), src.display());
                stats.clashes.push(dst);
            }
            continue;
        }

        if !dry_run {
            place_file(&src, &dst, mode)?;
        }
        debug!("Staged {} -> {}", src.display(), dst.display());
        stats.copied += 1;
    }

    Ok(stats)
}

/// Copy a directory tree, returning the number of files placed
pub fn copy_tree(source: &Path, destination: &Path, mode: CopyMode, dry_run: bool) -> io::Result<usize> {
    let mut files = 0;
    for entry in WalkDir::new(source).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            if !dry_run {
                fs::create_dir_all(&target)?;
            }
        } else {
            if !dry_run {
                place_file(entry.path(), &target, mode)?;
            }
            files += 1;
        }
    }
    Ok(files)
}

fn place_file(source: &Path, destination: &Path, mode: CopyMode) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    if mode == CopyMode::Link {
        match fs::hard_link(source, destination) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("Hard link of {} failed ({}), copying", source.display(), e),
        }
    }
    fs::copy(source, destination).map(|_| ())
}
