//! SQL DDL for the memory database.
//!
//! `memories` holds the active memory set; `schema_meta` holds key/value
//! bookkeeping (schema version, embedding model and dimension). All DDL uses
//! `IF NOT EXISTS` so initialization is idempotent.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Active memories. rowid gives insertion order for stable tie-breaks.
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    embedding BLOB,
    importance REAL NOT NULL DEFAULT 0.5 CHECK(importance >= 0.0 AND importance <= 1.0),
    tags TEXT NOT NULL DEFAULT '[]',
    source_entry_id TEXT,
    is_pinned INTEGER NOT NULL DEFAULT 0,
    memory_type TEXT NOT NULL CHECK(memory_type IN ('conversation','journal','manual')),
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"memories".to_string()));
        assert!(tables.contains(&"schema_meta".to_string()));
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn importance_is_range_checked() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO memories (id, content, importance, memory_type, created_at, last_accessed_at)
             VALUES ('a', 'x', 1.5, 'manual', 'now', 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
