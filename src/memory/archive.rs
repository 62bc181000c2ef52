//! Capacity pruning and the on-disk archive.
//!
//! When the active set grows past its limit, the lowest-value unpinned
//! memories are written to a timestamp-named JSON file and then removed from
//! the store. Archive files are written once (temp file + rename) and never
//! modified afterwards.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::memory::now_timestamp;
use crate::memory::types::{ArchiveRecord, Memory};

const ARCHIVE_PREFIX: &str = "archive-";
const ARCHIVE_EXT: &str = "json";

/// The `count - limit` memories to prune, lowest `(importance, last_accessed_at)`
/// first with insertion order as the final tie-break. Pinned memories are
/// never candidates, so fewer may be returned.
pub fn select_prune_candidates(memories: &[Memory], limit: usize) -> Vec<Memory> {
    let excess = memories.len().saturating_sub(limit);
    if excess == 0 {
        return Vec::new();
    }

    let mut candidates: Vec<&Memory> = memories.iter().filter(|m| !m.is_pinned).collect();
    candidates.sort_by(|a, b| {
        a.importance
            .total_cmp(&b.importance)
            .then_with(|| a.last_accessed_at.cmp(&b.last_accessed_at))
            .then_with(|| a.seq.cmp(&b.seq))
    });
    candidates.into_iter().take(excess).cloned().collect()
}

/// Write `memories` as one new archive file in `dir`. Returns its path.
pub fn write_archive(dir: &Path, memories: &[Memory], reason: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create archive directory {}", dir.display()))?;

    let record = ArchiveRecord {
        archived_at: now_timestamp(),
        reason: reason.to_string(),
        memories: memories.to_vec(),
    };
    let json = serde_json::to_vec_pretty(&record).context("failed to serialize archive")?;

    let path = unused_archive_path(dir);
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)
        .with_context(|| format!("failed to write archive {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("failed to finalize archive {}", path.display()))?;

    tracing::info!(path = %path.display(), count = memories.len(), "archived memories");
    Ok(path)
}

/// `archive-<UTC timestamp>.json`, with a counter suffix if that name is taken.
fn unused_archive_path(dir: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string();
    let mut path = dir.join(format!("{ARCHIVE_PREFIX}{stamp}.{ARCHIVE_EXT}"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{ARCHIVE_PREFIX}{stamp}-{n}.{ARCHIVE_EXT}"));
        n += 1;
    }
    path
}

/// Archive files in `dir`, oldest first. A missing directory has none.
pub fn list_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read archive directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_archive_file(p))
        .collect();
    paths.sort();
    Ok(paths)
}

fn is_archive_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.starts_with(ARCHIVE_PREFIX) && path.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXT)
}

pub fn read_archive(path: &Path) -> Result<ArchiveRecord> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read archive {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse archive {}", path.display()))
}
