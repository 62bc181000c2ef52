//! Core memory type definitions.
//!
//! Defines [`MemoryType`] (where a memory came from), [`Memory`] (a full
//! record), [`ArchiveRecord`] (a batch of pruned memories) and the small
//! request/response shapes used by the store.

use serde::{Deserialize, Serialize};

/// Where a memory originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Extracted from a chat exchange.
    Conversation,
    /// Extracted from a journal entry.
    Journal,
    /// Added directly by the user.
    Manual,
}

impl MemoryType {
    pub const ALL: [MemoryType; 3] = [Self::Conversation, Self::Journal, Self::Manual];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Journal => "journal",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(Self::Conversation),
            "journal" => Ok(Self::Journal),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("unknown memory type: {s}")),
        }
    }
}

/// A memory record, matching the `memories` table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub content: String,
    /// `None` when the embedding model was unavailable at write time; such
    /// memories are skipped by similarity search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// In `[0.0, 1.0]`.
    pub importance: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Journal entry this memory was extracted from. A lookup key only.
    pub source_entry_id: Option<String>,
    pub is_pinned: bool,
    pub memory_type: MemoryType,
    /// RFC 3339, fixed microsecond precision so strings sort chronologically.
    pub created_at: String,
    pub last_accessed_at: String,
    /// SQLite rowid; insertion order for tie-breaks. Not archived.
    #[serde(skip)]
    pub seq: i64,
}

/// Input for [`MemoryStore::add_memory`](super::store::MemoryStore::add_memory).
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub content: String,
    pub tags: Vec<String>,
    pub importance: f64,
    pub source_entry_id: Option<String>,
    pub memory_type: MemoryType,
}

impl NewMemory {
    pub fn new(content: impl Into<String>, memory_type: MemoryType) -> Self {
        Self {
            content: content.into(),
            tags: Vec::new(),
            importance: 0.5,
            source_entry_id: None,
            memory_type,
        }
    }

    pub fn importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn source_entry(mut self, entry_id: impl Into<String>) -> Self {
        self.source_entry_id = Some(entry_id.into());
        self
    }
}

/// A search hit with its cosine similarity to the query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub similarity: f64,
}

/// An immutable batch of pruned memories, written once to the archive directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// RFC 3339 time the batch was pruned.
    pub archived_at: String,
    pub reason: String,
    pub memories: Vec<Memory>,
}

/// A journal entry as seen by the memory and context layers.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub id: String,
    pub title: Option<String>,
    pub content: String,
    /// RFC 3339.
    pub created_at: String,
}
