//! Fact extraction: the prompts sent to the model and lenient parsing of
//! what comes back.
//!
//! The importance heuristic and keyword lists are tunable; nothing downstream
//! depends on their exact values.

use serde::Deserialize;

use crate::client::{ChatExchange, ChatMessage};
use crate::memory::types::JournalEntry;

/// Extraction is a summarization task; keep the model from getting creative.
const EXTRACTION_TEMPERATURE: f32 = 0.2;

/// Longest fact kept from a model reply, in characters.
const MAX_FACT_CHARS: usize = 300;

const CONVERSATION_PROMPT: &str = "You extract long-term memories from a conversation between a user \
and their journaling assistant. Reply with at most ONE short fact about the user, written in the \
third person (for example: \"The user's sister is called Maya.\"). Only record something worth \
remembering weeks from now: preferences, relationships, goals, important events. If there is \
nothing worth remembering, reply with exactly NONE.";

const ENTRY_PROMPT: &str = "You extract long-term memories from a journal entry. Reply with a JSON \
array only, no prose. Each element is an object with \"fact\" (one short third-person sentence about \
the writer), \"importance\" (a number from 0.0 to 1.0) and \"category\" (one word such as person, \
preference, goal, event, health, work). Return [] if nothing is worth remembering.";

/// Keyword groups that mark a statement as worth keeping. Each matched group
/// adds [`EMPHASIS_STEP`] to the base score.
const EMPHASIS_GROUPS: [&[&str]; 3] = [
    // explicit importance
    &["important", "remember", "never forget", "crucial", "essential", "matters to me"],
    // strong preference
    &["love", "hate", "favorite", "favourite", "can't stand", "prefer", "passionate"],
    // identity and relationships
    &[
        "my name", "my wife", "my husband", "my partner", "my mom", "my mother", "my dad",
        "my father", "my son", "my daughter", "my sister", "my brother", "my friend",
        "birthday", "anniversary",
    ],
];

const BASE_IMPORTANCE: f64 = 0.5;
const EMPHASIS_STEP: f64 = 0.2;

/// A fact pulled out of a journal entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFact {
    pub fact: String,
    pub importance: f64,
    pub category: String,
}

pub fn conversation_exchange(user_text: &str, ai_text: &str) -> ChatExchange {
    ChatExchange::new(vec![
        ChatMessage::system(CONVERSATION_PROMPT),
        ChatMessage::user(format!("User: {user_text}\nAssistant: {ai_text}")),
    ])
    .with_temperature(EXTRACTION_TEMPERATURE)
}

pub fn entry_exchange(entry: &JournalEntry) -> ChatExchange {
    let body = match &entry.title {
        Some(title) if !title.trim().is_empty() => format!("Title: {title}\n\n{}", entry.content),
        _ => entry.content.clone(),
    };
    ChatExchange::new(vec![
        ChatMessage::system(ENTRY_PROMPT),
        ChatMessage::user(body),
    ])
    .with_temperature(EXTRACTION_TEMPERATURE)
}

/// Base 0.5, plus 0.2 for every emphasis group the text touches, capped at 1.0.
pub fn importance_for(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let matched = EMPHASIS_GROUPS
        .iter()
        .filter(|group| group.iter().any(|kw| lower.contains(kw)))
        .count();
    (BASE_IMPORTANCE + EMPHASIS_STEP * matched as f64).min(1.0)
}

/// The single fact in a conversation-extraction reply, or `None` if the
/// model declined.
pub fn parse_single_fact(reply: &str) -> Option<String> {
    let line = reply.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = strip_list_marker(line);
    let line = line
        .strip_prefix("Fact:")
        .or_else(|| line.strip_prefix("fact:"))
        .unwrap_or(line)
        .trim()
        .trim_matches('"')
        .trim();

    let upper = line.trim_end_matches('.').to_ascii_uppercase();
    if line.is_empty() || upper == "NONE" || upper == "N/A" {
        return None;
    }
    Some(truncate_chars(line, MAX_FACT_CHARS))
}

#[derive(Debug, Deserialize)]
struct RawFact {
    #[serde(alias = "content", alias = "text")]
    fact: String,
    #[serde(default)]
    importance: Option<f64>,
    #[serde(default)]
    category: Option<String>,
}

/// Parse an entry-extraction reply. Accepts the JSON array wrapped in prose
/// or a code fence; falls back to one fact per bullet line.
pub fn parse_fact_list(reply: &str) -> Vec<ExtractedFact> {
    if let Some(json) = json_array_slice(reply) {
        if let Ok(raw) = serde_json::from_str::<Vec<RawFact>>(json) {
            return raw
                .into_iter()
                .filter_map(|r| {
                    let fact = r.fact.trim();
                    if fact.is_empty() {
                        return None;
                    }
                    Some(ExtractedFact {
                        fact: truncate_chars(fact, MAX_FACT_CHARS),
                        importance: r
                            .importance
                            .filter(|i| i.is_finite())
                            .unwrap_or(BASE_IMPORTANCE)
                            .clamp(0.0, 1.0),
                        category: r
                            .category
                            .map(|c| c.trim().to_lowercase())
                            .filter(|c| !c.is_empty())
                            .unwrap_or_else(|| "general".into()),
                    })
                })
                .collect();
        }
    }

    reply
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("- ") || l.starts_with("* "))
        .map(strip_list_marker)
        .filter(|l| !l.is_empty())
        .map(|l| ExtractedFact {
            fact: truncate_chars(l, MAX_FACT_CHARS),
            importance: importance_for(l),
            category: "general".into(),
        })
        .collect()
}

fn json_array_slice(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

fn strip_list_marker(line: &str) -> &str {
    line.trim_start_matches(|c: char| c == '-' || c == '*' || c == '•')
        .trim_start()
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
