//! Prompt assembly: the system prompt, remembered facts, recent journal
//! entries and the running conversation, packed into one [`ChatExchange`].
//!
//! Memory is best effort here. A failing store degrades to a prompt without
//! remembered facts; it never fails the chat.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::client::{ChatExchange, ChatMessage, ChatRole};
use crate::config::ContextConfig;
use crate::memory::{JournalEntry, Memory, MemoryStore};

/// Read access to the journal, which lives outside this crate.
#[async_trait]
pub trait EntryLookup: Send + Sync {
    /// Most recent entries, newest first.
    async fn recent_entries(&self, limit: usize) -> anyhow::Result<Vec<JournalEntry>>;
    async fn entry(&self, id: &str) -> anyhow::Result<Option<JournalEntry>>;
}

/// An empty journal, for hosts without one.
pub struct NoEntries;

#[async_trait]
impl EntryLookup for NoEntries {
    async fn recent_entries(&self, _limit: usize) -> anyhow::Result<Vec<JournalEntry>> {
        Ok(Vec::new())
    }

    async fn entry(&self, _id: &str) -> anyhow::Result<Option<JournalEntry>> {
        Ok(None)
    }
}

pub struct ContextAssembler {
    memory: Arc<MemoryStore>,
    entries: Arc<dyn EntryLookup>,
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(memory: Arc<MemoryStore>, entries: Arc<dyn EntryLookup>, config: ContextConfig) -> Self {
        Self {
            memory,
            entries,
            config,
        }
    }

    /// Build the exchange for `user_message`. `history` is the conversation
    /// so far, oldest first; only its tail is kept.
    pub async fn build_exchange(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        entry_id: Option<&str>,
    ) -> ChatExchange {
        let memories = self.relevant_memories(user_message, entry_id).await;
        let focus = match entry_id {
            Some(id) => self.entries.entry(id).await.unwrap_or_else(|e| {
                warn!(entry_id = id, error = %e, "entry lookup failed");
                None
            }),
            None => None,
        };
        let recent = self
            .entries
            .recent_entries(self.config.recent_entries)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "recent entry lookup failed");
                Vec::new()
            });

        debug!(
            memories = memories.len(),
            recent_entries = recent.len(),
            focused = focus.is_some(),
            "assembled chat context"
        );

        let system = self.system_message(&memories, focus.as_ref(), &recent);
        let mut messages = Vec::with_capacity(self.config.history_messages + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(bounded_history(history, self.config.history_messages));
        messages.push(ChatMessage::user(user_message));
        ChatExchange::new(messages)
    }

    /// Extract and store a memory from a finished exchange. Failures are
    /// logged and swallowed.
    pub async fn remember_exchange(&self, user_text: &str, ai_text: &str) -> Option<Memory> {
        match self.memory.add_memory_from_conversation(user_text, ai_text).await {
            Ok(memory) => memory,
            Err(e) => {
                warn!(error = %e, "failed to remember conversation");
                None
            }
        }
    }

    /// Memories from the focused entry if there is one, otherwise the ones
    /// closest to the message, falling back to the general ranking.
    async fn relevant_memories(&self, user_message: &str, entry_id: Option<&str>) -> Vec<Memory> {
        let limit = self.config.memory_limit;
        if limit == 0 {
            return Vec::new();
        }

        if entry_id.is_none() && !user_message.trim().is_empty() {
            match self.memory.search_memories(user_message, limit).await {
                Ok(hits) if !hits.is_empty() => {
                    return hits.into_iter().map(|h| h.memory).collect();
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "memory search failed, using ranked memories"),
            }
        }

        self.memory
            .get_memories_for_context(entry_id, limit)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "memory lookup failed, continuing without memories");
                Vec::new()
            })
    }

    fn system_message(
        &self,
        memories: &[Memory],
        focus: Option<&JournalEntry>,
        recent: &[JournalEntry],
    ) -> String {
        let mut out = self.config.system_prompt.trim().to_string();

        if !memories.is_empty() {
            out.push_str("\n\nWhat you remember about the user:");
            for m in memories {
                out.push_str("\n- ");
                out.push_str(&m.content);
            }
        }

        if let Some(entry) = focus {
            out.push_str("\n\nThe user is asking about this journal entry:\n");
            out.push_str(&entry_heading(entry));
            out.push('\n');
            out.push_str(entry.content.trim());
        }

        let recent: Vec<&JournalEntry> = recent
            .iter()
            .filter(|e| focus.map_or(true, |f| f.id != e.id))
            .collect();
        if !recent.is_empty() {
            out.push_str("\n\nRecent journal entries:");
            for entry in recent {
                out.push_str("\n- ");
                out.push_str(&entry_heading(entry));
                out.push_str(": ");
                out.push_str(&preview(&entry.content, self.config.entry_preview_chars));
            }
        }

        out
    }
}

fn entry_heading(entry: &JournalEntry) -> String {
    let date = entry.created_at.get(..10).unwrap_or(&entry.created_at);
    match entry.title.as_deref().map(str::trim) {
        Some(title) if !title.is_empty() => format!("[{date}] {title}"),
        _ => format!("[{date}]"),
    }
}

/// First `max` characters on one line, with an ellipsis when cut.
fn preview(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", flat[..idx].trim_end()),
        None => flat,
    }
}

/// The last `max` user and assistant turns. System messages in the history
/// are dropped; the assembler writes its own.
fn bounded_history(history: &[ChatMessage], max: usize) -> Vec<ChatMessage> {
    let turns: Vec<&ChatMessage> = history
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .collect();
    let skip = turns.len().saturating_sub(max);
    turns.into_iter().skip(skip).cloned().collect()
}
