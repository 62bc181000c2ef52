pub mod archive;
pub mod extract;
pub mod search;
pub mod stats;
pub mod store;
pub mod types;

pub use store::MemoryStore;
pub use types::{ArchiveRecord, JournalEntry, Memory, MemoryType, NewMemory, ScoredMemory};

/// Current time as RFC 3339 with fixed microsecond precision, so stored
/// timestamps compare correctly as strings.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
