//! Local AI runtime for a private journaling app.
//!
//! Tether keeps a local inference server alive, talks to it over a streaming
//! HTTP API, and remembers facts about the user between conversations.
//!
//! # Architecture
//!
//! - **Supervisor**: a single actor task owns the server process. It locates,
//!   launches and health-checks the executable, publishes a
//!   [`ServiceState`](supervisor::ServiceState), and recovers from crashes with
//!   a bounded number of relaunches.
//! - **Client**: streamed chat and model pulls over line-delimited JSON,
//!   embeddings, and a cached health check, all behind a retry policy that only
//!   retries transient failures.
//! - **Memory**: facts in SQLite with their embeddings, ranked by cosine
//!   similarity. Past capacity, the lowest-value unpinned memories are written
//!   to a JSON archive and removed.
//! - **Context**: packs remembered facts, recent journal entries and the
//!   conversation into one chat request.
//!
//! # Modules
//!
//! - [`config`]: configuration from TOML files and environment variables
//! - [`error`]: the service error taxonomy
//! - [`supervisor`]: process supervision and health
//! - [`client`]: the streaming inference client
//! - [`embedding`]: the embedding seam and vector helpers
//! - [`db`]: SQLite schema and migrations
//! - [`memory`]: the semantic memory store
//! - [`context`]: prompt assembly
//! - [`app`]: service construction

pub mod app;
pub mod client;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod supervisor;
