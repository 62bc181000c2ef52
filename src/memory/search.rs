//! Ranking over the cached memory set.
//!
//! Two orderings: cosine similarity to a query embedding, and the context
//! ranking (pinned first, then importance, then recency). Both are stable
//! sorts over memories held in insertion order, so ties keep storage order
//! and results are deterministic for a fixed memory set.

use std::cmp::Ordering;

use crate::embedding::cosine_similarity;
use crate::memory::types::{Memory, ScoredMemory};

/// Top `limit` memories by cosine similarity to `query`, best first.
///
/// Memories without an embedding, or with one of a different length, are skipped.
pub fn rank_by_similarity(memories: &[Memory], query: &[f32], limit: usize) -> Vec<ScoredMemory> {
    let mut scored: Vec<ScoredMemory> = memories
        .iter()
        .filter_map(|m| {
            let embedding = m.embedding.as_deref()?;
            (embedding.len() == query.len()).then(|| ScoredMemory {
                similarity: cosine_similarity(query, embedding),
                memory: m.clone(),
            })
        })
        .collect();

    scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    scored.truncate(limit);
    scored
}

/// Pinned first, then higher importance, then most recently accessed.
pub fn context_order(a: &Memory, b: &Memory) -> Ordering {
    b.is_pinned
        .cmp(&a.is_pinned)
        .then_with(|| b.importance.total_cmp(&a.importance))
        .then_with(|| b.last_accessed_at.cmp(&a.last_accessed_at))
}

/// Memories to feed into a prompt. With an `entry_id`, memories sourced from
/// that entry come first; the rest of the slots use [`context_order`].
pub fn select_for_context(memories: &[Memory], entry_id: Option<&str>, limit: usize) -> Vec<Memory> {
    let mut ranked: Vec<&Memory> = memories.iter().collect();
    ranked.sort_by(|a, b| context_order(a, b));

    let from_entry = |m: &Memory| entry_id.is_some() && m.source_entry_id.as_deref() == entry_id;
    let (mut selected, rest): (Vec<&Memory>, Vec<&Memory>) =
        ranked.into_iter().partition(|m| from_entry(m));
    selected.extend(rest);

    selected.into_iter().take(limit).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::MemoryType;

    fn memory(seq: i64, embedding: Option<Vec<f32>>) -> Memory {
        Memory {
            id: format!("m{seq}"),
            content: format!("memory {seq}"),
            embedding,
            importance: 0.5,
            tags: Vec::new(),
            source_entry_id: None,
            is_pinned: false,
            memory_type: MemoryType::Manual,
            created_at: "2026-01-01T00:00:00.000000Z".into(),
            last_accessed_at: "2026-01-01T00:00:00.000000Z".into(),
            seq,
        }
    }

    #[test]
    fn ranks_by_descending_similarity() {
        let memories = vec![
            memory(1, Some(vec![0.0, 1.0])),
            memory(2, Some(vec![1.0, 0.0])),
            memory(3, Some(vec![0.7, 0.7])),
        ];
        let ranked = rank_by_similarity(&memories, &[1.0, 0.0], 10);
        let ids: Vec<_> = ranked.iter().map(|s| s.memory.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m1"]);
        assert!(ranked.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }

    #[test]
    fn respects_limit_and_skips_unembedded() {
        let memories = vec![
            memory(1, None),
            memory(2, Some(vec![1.0, 0.0])),
            memory(3, Some(vec![1.0, 0.1])),
            memory(4, Some(vec![1.0, 0.0, 0.0])),
        ];
        let ranked = rank_by_similarity(&memories, &[1.0, 0.0], 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].memory.id, "m2");

        let all = rank_by_similarity(&memories, &[1.0, 0.0], 10);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let memories = vec![
            memory(1, Some(vec![2.0, 0.0])),
            memory(2, Some(vec![1.0, 0.0])),
            memory(3, Some(vec![5.0, 0.0])),
        ];
        let ranked = rank_by_similarity(&memories, &[1.0, 0.0], 3);
        let ids: Vec<_> = ranked.iter().map(|s| s.memory.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn context_prefers_pinned_then_importance_then_recency() {
        let mut a = memory(1, None);
        a.importance = 0.9;
        let mut b = memory(2, None);
        b.is_pinned = true;
        b.importance = 0.1;
        let mut c = memory(3, None);
        c.importance = 0.9;
        c.last_accessed_at = "2026-02-01T00:00:00.000000Z".into();
        let d = memory(4, None);

        let selected = select_for_context(&[a, b, c, d], None, 3);
        let ids: Vec<_> = selected.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m1"]);
    }

    #[test]
    fn entry_sourced_memories_come_first() {
        let mut a = memory(1, None);
        a.importance = 1.0;
        let mut b = memory(2, None);
        b.source_entry_id = Some("entry-7".into());
        b.importance = 0.1;

        let selected = select_for_context(&[a.clone(), b], Some("entry-7"), 2);
        assert_eq!(selected[0].id, "m2");
        assert_eq!(selected[1].id, "m1");

        let selected = select_for_context(&[a], Some("entry-7"), 2);
        assert_eq!(selected.len(), 1);
    }
}
