use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use crate::db::migrations;
use crate::memory::archive;
use crate::memory::types::MemoryType;

/// Summary of the memory store.
#[derive(Debug, Serialize)]
pub struct MemoryStats {
    pub total_memories: u64,
    pub pinned_memories: u64,
    /// Memories stored without an embedding are invisible to search.
    pub embedded_memories: u64,
    pub by_type: HashMap<String, u64>,
    pub archive_files: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_dim: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_memory: Option<String>,
}

/// Compute memory store statistics. `archive_dir` may not exist yet.
pub fn memory_stats(conn: &Connection, archive_dir: &Path) -> Result<MemoryStats> {
    let (total, pinned, embedded) = count_memories(conn)?;
    let by_type = count_by_type(conn)?;
    let (oldest, newest) = memory_time_range(conn)?;
    let archive_files = archive::list_archives(archive_dir)?.len() as u64;

    Ok(MemoryStats {
        total_memories: total,
        pinned_memories: pinned,
        embedded_memories: embedded,
        by_type,
        archive_files,
        embedding_dim: migrations::get_embedding_dim(conn)?,
        embedding_model: migrations::get_embedding_model(conn)?,
        oldest_memory: oldest,
        newest_memory: newest,
    })
}

/// Total, pinned, and embedded counts.
fn count_memories(conn: &Connection) -> Result<(u64, u64, u64)> {
    let (total, pinned, embedded): (i64, Option<i64>, Option<i64>) = conn.query_row(
        "SELECT COUNT(*), SUM(is_pinned), SUM(embedding IS NOT NULL) FROM memories",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok((
        total as u64,
        pinned.unwrap_or(0) as u64,
        embedded.unwrap_or(0) as u64,
    ))
}

/// Count by memory type; every type is present, even at zero.
fn count_by_type(conn: &Connection) -> Result<HashMap<String, u64>> {
    let mut map: HashMap<String, u64> = MemoryType::ALL
        .iter()
        .map(|t| (t.as_str().to_string(), 0))
        .collect();

    let mut stmt = conn.prepare("SELECT memory_type, COUNT(*) FROM memories GROUP BY memory_type")?;
    let rows: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    for (t, count) in rows {
        map.insert(t, count as u64);
    }
    Ok(map)
}

fn memory_time_range(conn: &Connection) -> Result<(Option<String>, Option<String>)> {
    let range = conn.query_row(
        "SELECT MIN(created_at), MAX(created_at) FROM memories",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(range)
}
