//! CLI memory commands: remember, recall and the `memories` subcommands.

use std::io::Write;

use anyhow::{bail, Result};
use tether::app::App;
use tether::memory::{MemoryType, NewMemory};

pub async fn remember(app: &App, text: &str, importance: f64, tags: Vec<String>) -> Result<()> {
    if !(0.0..=1.0).contains(&importance) {
        bail!("importance must be between 0.0 and 1.0");
    }
    let memory = app
        .memory
        .add_memory(
            NewMemory::new(text, MemoryType::Manual)
                .importance(importance)
                .tags(tags),
        )
        .await?;

    println!("Stored memory {}", memory.id);
    if memory.embedding.is_none() {
        println!("  (no embedding: the server was unavailable, so search will not find it)");
    }
    Ok(())
}

pub async fn recall(app: &App, query: &str, limit: Option<usize>) -> Result<()> {
    let limit = limit.unwrap_or(app.config.memory.default_search_limit);
    let hits = app.memory.search_memories(query, limit).await?;

    if hits.is_empty() {
        println!("No matching memories.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let m = &hit.memory;
        let pin = if m.is_pinned { " [pinned]" } else { "" };
        println!(
            "{}. [{:.3}] {}{pin}",
            i + 1,
            hit.similarity,
            m.content
        );
        println!(
            "   id: {}  type: {}  importance: {:.2}  tags: {}",
            m.id,
            m.memory_type,
            m.importance,
            m.tags.join(", ")
        );
    }
    Ok(())
}

pub async fn stats(app: &App) -> Result<()> {
    let stats = app.memory.stats().await?;

    println!("Memory Statistics");
    println!("{}", "=".repeat(40));
    println!("  Total memories:      {}", stats.total_memories);
    println!("  Capacity:            {}", app.config.memory.max_memories);
    println!("  Pinned:              {}", stats.pinned_memories);
    println!("  With embedding:      {}", stats.embedded_memories);
    println!();

    println!("By Type:");
    for t in MemoryType::ALL {
        let count = stats.by_type.get(t.as_str()).copied().unwrap_or(0);
        println!("  {:<14} {}", t.as_str(), count);
    }
    println!();

    println!("Archive files:         {}", stats.archive_files);
    if let Some(dim) = stats.embedding_dim {
        let model = stats.embedding_model.as_deref().unwrap_or("unknown model");
        println!("Embeddings:            {dim} dimensions ({model})");
    }
    if let Some(ref oldest) = stats.oldest_memory {
        println!("Oldest memory:         {oldest}");
    }
    if let Some(ref newest) = stats.newest_memory {
        println!("Newest memory:         {newest}");
    }
    Ok(())
}

pub async fn prune(app: &App) -> Result<()> {
    match app.memory.prune().await? {
        Some(path) => println!("Archived to {}", path.display()),
        None => println!("Nothing to prune."),
    }
    Ok(())
}

pub async fn pin(app: &App, id: &str) -> Result<()> {
    let pinned = app.memory.toggle_memory_pin(id).await?;
    println!("{} {id}", if pinned { "Pinned" } else { "Unpinned" });
    Ok(())
}

pub async fn delete(app: &App, id: &str) -> Result<()> {
    if !app.memory.delete_memory(id).await? {
        bail!("memory not found: {id}");
    }
    println!("Deleted {id}");
    Ok(())
}

pub async fn clear(app: &App, memory_type: Option<MemoryType>, yes: bool) -> Result<()> {
    if !yes {
        let what = memory_type.map_or("ALL".to_string(), |t| format!("all {t}"));
        println!("WARNING: This will permanently delete {what} memories.");
        print!("\nType YES to confirm: ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if input.trim() != "YES" {
            bail!("clear cancelled");
        }
    }

    let deleted = app.memory.clear_all_memories(memory_type).await?;
    println!("Deleted {deleted} memories.");
    Ok(())
}

pub async fn archives(app: &App) -> Result<()> {
    let paths = app.memory.list_archives().await?;
    if paths.is_empty() {
        println!("No archives.");
        return Ok(());
    }
    for path in paths {
        match tether::memory::MemoryStore::read_archive(&path) {
            Ok(record) => println!(
                "{}  {} memories  ({})",
                path.display(),
                record.memories.len(),
                record.reason
            ),
            Err(e) => println!("{}  unreadable: {e}", path.display()),
        }
    }
    Ok(())
}
