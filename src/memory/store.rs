//! The memory store: SQL row access plus the [`MemoryStore`] service.
//!
//! Rows are read and written by the free functions here, each taking a
//! `&Connection`. [`MemoryStore`] owns the connection and an in-memory copy of
//! every row (dropped on each mutation), embeds text through an
//! [`EmbeddingProvider`], extracts facts through a [`ChatCompletion`], and
//! keeps the active set under its capacity by archiving. All database and
//! archive work for one operation runs under a single lock on a blocking
//! thread, so operations never interleave.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::client::ChatCompletion;
use crate::db::migrations;
use crate::embedding::{bytes_to_embedding, embedding_to_bytes, EmbeddingProvider};
use crate::memory::archive;
use crate::memory::extract;
use crate::memory::search;
use crate::memory::stats::{self, MemoryStats};
use crate::memory::now_timestamp;
use crate::memory::types::{JournalEntry, Memory, MemoryType, NewMemory, ScoredMemory};

const SELECT_COLUMNS: &str = "SELECT rowid, id, content, embedding, importance, tags, source_entry_id, \
     is_pinned, memory_type, created_at, last_accessed_at FROM memories";

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let embedding: Option<Vec<u8>> = row.get(3)?;
    let tags: String = row.get(5)?;
    let memory_type: String = row.get(8)?;
    Ok(Memory {
        seq: row.get(0)?,
        id: row.get(1)?,
        content: row.get(2)?,
        embedding: embedding.map(|b| bytes_to_embedding(&b)),
        importance: row.get(4)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        source_entry_id: row.get(6)?,
        is_pinned: row.get(7)?,
        memory_type: memory_type.parse::<MemoryType>().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, e.into())
        })?,
        created_at: row.get(9)?,
        last_accessed_at: row.get(10)?,
    })
}

/// Every memory, in insertion order.
pub fn load_memories(conn: &Connection) -> Result<Vec<Memory>> {
    let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY rowid"))?;
    let memories = stmt
        .query_map([], row_to_memory)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(memories)
}

pub fn get_memory(conn: &Connection, id: &str) -> Result<Option<Memory>> {
    let memory = conn
        .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), [id], row_to_memory)
        .optional()?;
    Ok(memory)
}

/// Insert a row. Returns the new rowid.
pub fn insert_memory(conn: &Connection, memory: &Memory) -> Result<i64> {
    let embedding = memory.embedding.as_deref().map(embedding_to_bytes);
    let tags = serde_json::to_string(&memory.tags)?;
    conn.execute(
        "INSERT INTO memories (id, content, embedding, importance, tags, source_entry_id, is_pinned, \
         memory_type, created_at, last_accessed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            memory.id,
            memory.content,
            embedding,
            memory.importance,
            tags,
            memory.source_entry_id,
            memory.is_pinned,
            memory.memory_type.as_str(),
            memory.created_at,
            memory.last_accessed_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Set `last_accessed_at` on each id.
pub fn touch_memories(conn: &mut Connection, ids: &[&str], now: &str) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare("UPDATE memories SET last_accessed_at = ?1 WHERE id = ?2")?;
        for id in ids {
            stmt.execute(params![now, id])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Returns `false` if no memory has that id.
pub fn set_pinned(conn: &Connection, id: &str, pinned: bool) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE memories SET is_pinned = ?1 WHERE id = ?2",
        params![pinned, id],
    )?;
    Ok(rows > 0)
}

/// Returns `false` if no memory has that id.
pub fn set_importance(conn: &Connection, id: &str, importance: f64) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE memories SET importance = ?1 WHERE id = ?2",
        params![importance, id],
    )?;
    Ok(rows > 0)
}

pub fn delete_memories(conn: &mut Connection, ids: &[&str]) -> Result<usize> {
    let tx = conn.transaction()?;
    let mut deleted = 0;
    {
        let mut stmt = tx.prepare("DELETE FROM memories WHERE id = ?1")?;
        for id in ids {
            deleted += stmt.execute([id])?;
        }
    }
    tx.commit()?;
    Ok(deleted)
}

/// Delete every memory, or every memory of one type.
pub fn clear_memories(conn: &Connection, memory_type: Option<MemoryType>) -> Result<usize> {
    let deleted = match memory_type {
        Some(t) => conn.execute("DELETE FROM memories WHERE memory_type = ?1", [t.as_str()])?,
        None => conn.execute("DELETE FROM memories", [])?,
    };
    Ok(deleted)
}

/// Connection plus the cached rows. Only ever touched under the store's lock.
struct StoreState {
    conn: Connection,
    cache: Option<Vec<Memory>>,
    archive_dir: PathBuf,
    max_memories: usize,
}

impl StoreState {
    fn memories(&mut self) -> Result<&mut Vec<Memory>> {
        if self.cache.is_none() {
            self.cache = Some(load_memories(&self.conn)?);
        }
        self.cache
            .as_mut()
            .ok_or_else(|| anyhow!("memory cache unavailable"))
    }

    fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Reject an embedding whose length differs from the stored dimension;
    /// the first one stored fixes it.
    fn check_dimension(&self, embedding: &[f32], model: &str) -> Result<()> {
        match migrations::get_embedding_dim(&self.conn)? {
            Some(dim) if dim != embedding.len() => bail!(
                "embedding dimension mismatch: the store holds {dim}-dimensional vectors \
                 but {model} produced {}",
                embedding.len()
            ),
            Some(_) => Ok(()),
            None => {
                migrations::set_embedding_dim(&self.conn, embedding.len())?;
                migrations::set_embedding_model(&self.conn, model)?;
                Ok(())
            }
        }
    }

    /// Archive and delete the lowest-value unpinned memories while over capacity.
    fn prune(&mut self) -> Result<Option<PathBuf>> {
        let limit = self.max_memories;
        let memories = self.memories()?;
        let count = memories.len();
        if count <= limit {
            return Ok(None);
        }

        let candidates = archive::select_prune_candidates(memories, limit);
        if candidates.is_empty() {
            tracing::warn!(count, limit, "over capacity but every memory is pinned");
            return Ok(None);
        }

        let reason = format!("capacity: {count} memories exceeded the limit of {limit}");
        let path = archive::write_archive(&self.archive_dir, &candidates, &reason)?;

        let ids: Vec<&str> = candidates.iter().map(|m| m.id.as_str()).collect();
        let deleted = delete_memories(&mut self.conn, &ids)?;
        self.invalidate();

        tracing::info!(
            archived = candidates.len(),
            deleted,
            remaining = count - deleted,
            path = %path.display(),
            "pruned memories"
        );
        Ok(Some(path))
    }
}

pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    embedder: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatCompletion>,
}

impl MemoryStore {
    pub fn new(
        conn: Connection,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatCompletion>,
        archive_dir: impl Into<PathBuf>,
        max_memories: usize,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                conn,
                cache: None,
                archive_dir: archive_dir.into(),
                max_memories,
            })),
            embedder,
            chat,
        }
    }

    /// Run `f` against the locked state on a blocking thread.
    async fn with_state<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreState) -> Result<T> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || {
            let mut guard = state
                .lock()
                .map_err(|e| anyhow!("memory store lock poisoned: {e}"))?;
            f(&mut guard)
        })
        .await
        .context("memory store task failed")?
    }

    /// Embed and persist one memory, then prune if the store is over capacity.
    ///
    /// An embedding failure is logged and the memory is stored without one.
    pub async fn add_memory(&self, new: NewMemory) -> Result<Memory> {
        let content = new.content.trim().to_string();
        if content.is_empty() {
            bail!("memory content must not be empty");
        }

        let embedding = match self.embedder.embed(&content).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => {
                tracing::warn!("embedding model returned an empty vector, storing memory without one");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed, storing memory without one");
                None
            }
        };

        let now = now_timestamp();
        let mut memory = Memory {
            id: uuid::Uuid::now_v7().to_string(),
            content,
            embedding,
            importance: new.importance.clamp(0.0, 1.0),
            tags: new.tags,
            source_entry_id: new.source_entry_id,
            is_pinned: false,
            memory_type: new.memory_type,
            created_at: now.clone(),
            last_accessed_at: now,
            seq: 0,
        };
        let model = self.embedder.model_name().to_string();

        self.with_state(move |state| {
            if let Some(embedding) = &memory.embedding {
                state.check_dimension(embedding, &model)?;
            }
            memory.seq = insert_memory(&state.conn, &memory)?;
            state.invalidate();
            tracing::info!(
                id = %memory.id,
                memory_type = %memory.memory_type,
                importance = memory.importance,
                embedded = memory.embedding.is_some(),
                "memory stored"
            );
            // the row is committed; a failed prune must not report the add as failed
            if let Err(e) = state.prune() {
                tracing::warn!(error = %e, "prune after insert failed, store stays over capacity");
            }
            Ok(memory)
        })
        .await
    }

    /// Ask the model for at most one fact worth keeping from a chat exchange.
    /// Returns `None` when the model found nothing.
    pub async fn add_memory_from_conversation(
        &self,
        user_text: &str,
        ai_text: &str,
    ) -> Result<Option<Memory>> {
        let reply = self
            .chat
            .complete(&extract::conversation_exchange(user_text, ai_text))
            .await
            .context("fact extraction failed")?;

        let Some(fact) = extract::parse_single_fact(&reply) else {
            tracing::debug!("no memorable fact in conversation");
            return Ok(None);
        };

        let new = NewMemory::new(fact, MemoryType::Conversation)
            .importance(extract::importance_for(user_text))
            .tags(vec!["conversation".into()]);
        self.add_memory(new).await.map(Some)
    }

    /// Extract every fact from a journal entry in one model call and store
    /// each as a memory tagged with its category.
    pub async fn add_memory_from_entry(&self, entry: &JournalEntry) -> Result<Vec<Memory>> {
        let reply = self
            .chat
            .complete(&extract::entry_exchange(entry))
            .await
            .context("fact extraction failed")?;

        let facts = extract::parse_fact_list(&reply);
        tracing::debug!(entry_id = %entry.id, facts = facts.len(), "extracted facts from entry");

        let mut stored = Vec::with_capacity(facts.len());
        for fact in facts {
            let new = NewMemory::new(fact.fact, MemoryType::Journal)
                .importance(fact.importance)
                .tags(vec![fact.category])
                .source_entry(entry.id.clone());
            stored.push(self.add_memory(new).await?);
        }
        Ok(stored)
    }

    /// Top `limit` memories by cosine similarity to `query`. Every returned
    /// memory has its `last_accessed_at` bumped.
    pub async fn search_memories(&self, query: &str, limit: usize) -> Result<Vec<ScoredMemory>> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_embedding = self
            .embedder
            .embed(query)
            .await
            .context("failed to embed search query")?;

        self.with_state(move |state| {
            let mut ranked = search::rank_by_similarity(state.memories()?, &query_embedding, limit);
            let ids: Vec<String> = ranked.iter().map(|s| s.memory.id.clone()).collect();
            let now = mark_accessed(state, &ids)?;
            for hit in &mut ranked {
                hit.memory.last_accessed_at = now.clone();
            }
            Ok(ranked)
        })
        .await
    }

    /// Memories for a prompt: those sourced from `entry_id` first, then
    /// pinned, important and recently used ones. Bumps `last_accessed_at`.
    pub async fn get_memories_for_context(
        &self,
        entry_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let entry_id = entry_id.map(str::to_string);
        self.with_state(move |state| {
            let mut selected =
                search::select_for_context(state.memories()?, entry_id.as_deref(), limit);
            let ids: Vec<String> = selected.iter().map(|m| m.id.clone()).collect();
            let now = mark_accessed(state, &ids)?;
            for memory in &mut selected {
                memory.last_accessed_at = now.clone();
            }
            Ok(selected)
        })
        .await
    }

    /// Flip the pin flag. Returns the new value.
    pub async fn toggle_memory_pin(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_state(move |state| {
            let current = get_memory(&state.conn, &id)?
                .ok_or_else(|| anyhow!("memory not found: {id}"))?;
            let pinned = !current.is_pinned;
            set_pinned(&state.conn, &id, pinned)?;
            state.invalidate();
            tracing::info!(id = %id, pinned, "memory pin toggled");
            Ok(pinned)
        })
        .await
    }

    pub async fn update_memory_importance(&self, id: &str, importance: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&importance) {
            bail!("importance must be between 0.0 and 1.0, got {importance}");
        }
        let id = id.to_string();
        self.with_state(move |state| {
            if !set_importance(&state.conn, &id, importance)? {
                bail!("memory not found: {id}");
            }
            state.invalidate();
            Ok(())
        })
        .await
    }

    /// Returns `false` if there was no such memory.
    pub async fn delete_memory(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_state(move |state| {
            let deleted = delete_memories(&mut state.conn, &[id.as_str()])? > 0;
            state.invalidate();
            if deleted {
                tracing::info!(id = %id, "memory deleted");
            }
            Ok(deleted)
        })
        .await
    }

    /// Delete all memories, or only those of `memory_type`. Clearing everything
    /// also releases the embedding dimension, so a different model can be used.
    pub async fn clear_all_memories(&self, memory_type: Option<MemoryType>) -> Result<usize> {
        self.with_state(move |state| {
            let deleted = clear_memories(&state.conn, memory_type)?;
            if memory_type.is_none() {
                migrations::clear_embedding_dim(&state.conn)?;
            }
            state.invalidate();
            tracing::info!(
                deleted,
                memory_type = memory_type.map(|t| t.as_str()).unwrap_or("all"),
                "memories cleared"
            );
            Ok(deleted)
        })
        .await
    }

    pub async fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        let id = id.to_string();
        self.with_state(move |state| Ok(state.memories()?.iter().find(|m| m.id == id).cloned()))
            .await
    }

    /// Every memory, in insertion order.
    pub async fn all_memories(&self) -> Result<Vec<Memory>> {
        self.with_state(|state| Ok(state.memories()?.clone())).await
    }

    /// Prune now rather than waiting for the next insert.
    pub async fn prune(&self) -> Result<Option<PathBuf>> {
        self.with_state(|state| state.prune()).await
    }

    pub async fn stats(&self) -> Result<MemoryStats> {
        self.with_state(|state| stats::memory_stats(&state.conn, &state.archive_dir))
            .await
    }

    /// Archive files, oldest first.
    pub async fn list_archives(&self) -> Result<Vec<PathBuf>> {
        self.with_state(|state| archive::list_archives(&state.archive_dir))
            .await
    }

    pub fn read_archive(path: &Path) -> Result<crate::memory::ArchiveRecord> {
        archive::read_archive(path)
    }
}

/// Persist an access-time bump for `ids` and mirror it into the cache
/// instead of dropping it.
fn mark_accessed(state: &mut StoreState, ids: &[String]) -> Result<String> {
    let now = now_timestamp();
    if ids.is_empty() {
        return Ok(now);
    }
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    touch_memories(&mut state.conn, &refs, &now)?;
    for memory in state.memories()?.iter_mut() {
        if ids.contains(&memory.id) {
            memory.last_accessed_at = now.clone();
        }
    }
    Ok(now)
}
