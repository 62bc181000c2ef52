#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use tether::client::{ChatCompletion, ChatExchange};
use tether::config::{ClientConfig, RetryConfig, SupervisorConfig};
use tether::context::EntryLookup;
use tether::embedding::EmbeddingProvider;
use tether::error::{ServiceError, ServiceResult};
use tether::memory::{now_timestamp, JournalEntry, Memory, MemoryStore, MemoryType};
use tether::supervisor::{
    ExitOutcome, HealthProbe, Launcher, ProbeOutcome, ServerEvent, ServiceState, SpawnedServer,
    Supervisor,
};

// ── Fake inference server ───────────────────────────────────────────────────

/// Serve `router` on an ephemeral localhost port. Returns the base URL.
pub async fn spawn_server(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Client config pointed at `base_url` with millisecond retry delays.
pub fn client_config(base_url: &str) -> ClientConfig {
    ClientConfig {
        base_url: Some(base_url.to_string()),
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
        },
        ..ClientConfig::default()
    }
}

// ── Memory store fakes ──────────────────────────────────────────────────────

/// Embeds registered texts to fixed vectors and anything else to a constant
/// vector of the current dimension.
pub struct FakeEmbedder {
    dim: AtomicUsize,
    failing: AtomicBool,
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    pub calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim: AtomicUsize::new(dim),
            failing: AtomicBool::new(false),
            vectors: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, text: &str, vector: Vec<f32>) {
        self.vectors.lock().unwrap().insert(text.to_string(), vector);
    }

    pub fn set_dim(&self, dim: usize) {
        self.dim.store(dim, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("embedding server unavailable"));
        }
        if let Some(v) = self.vectors.lock().unwrap().get(text) {
            return Ok(v.clone());
        }
        Ok(vec![0.1; self.dim.load(Ordering::SeqCst)])
    }

    fn model_name(&self) -> &str {
        "fake-embed"
    }
}

/// Answers with scripted replies in order; fails once the script runs out.
#[derive(Default)]
pub struct FakeChat {
    replies: Mutex<VecDeque<String>>,
    pub exchanges: Mutex<Vec<ChatExchange>>,
}

impl FakeChat {
    pub fn reply(&self, text: &str) {
        self.replies.lock().unwrap().push_back(text.to_string());
    }
}

#[async_trait]
impl ChatCompletion for FakeChat {
    async fn complete(&self, exchange: &ChatExchange) -> Result<String> {
        self.exchanges.lock().unwrap().push(exchange.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted reply"))
    }
}

pub struct FakeEntries(pub Vec<JournalEntry>);

#[async_trait]
impl EntryLookup for FakeEntries {
    async fn recent_entries(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        Ok(self.0.iter().take(limit).cloned().collect())
    }

    async fn entry(&self, id: &str) -> Result<Option<JournalEntry>> {
        Ok(self.0.iter().find(|e| e.id == id).cloned())
    }
}

pub fn journal_entry(id: &str, title: &str, content: &str) -> JournalEntry {
    JournalEntry {
        id: id.into(),
        title: Some(title.into()),
        content: content.into(),
        created_at: now_timestamp(),
    }
}

/// A store over a fresh in-memory database.
pub fn memory_store(
    embedder: Arc<FakeEmbedder>,
    chat: Arc<FakeChat>,
    archive_dir: &Path,
    max_memories: usize,
) -> MemoryStore {
    let conn = tether::db::open_memory_database().unwrap();
    MemoryStore::new(conn, embedder, chat, archive_dir, max_memories)
}

/// A memory row ready for `store::insert_memory`.
pub fn memory_row(id: &str, importance: f64, embedding: Option<Vec<f32>>) -> Memory {
    let now = now_timestamp();
    Memory {
        id: id.into(),
        content: format!("memory {id}"),
        embedding,
        importance,
        tags: Vec::new(),
        source_entry_id: None,
        is_pinned: false,
        memory_type: MemoryType::Manual,
        created_at: now.clone(),
        last_accessed_at: now,
        seq: 0,
    }
}

// ── Supervisor fakes ────────────────────────────────────────────────────────

/// Probe answers: scripted ones first, then the fallback forever.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeOutcome>>,
    fallback: Mutex<ProbeOutcome>,
    pub calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(script: Vec<ProbeOutcome>, fallback: ProbeOutcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Mutex::new(fallback),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_fallback(&self, outcome: ProbeOutcome) {
        *self.fallback.lock().unwrap() = outcome;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            return outcome;
        }
        self.fallback.lock().unwrap().clone()
    }
}

/// Pretends to run the server. Each spawn takes the next scripted exit: `None`
/// keeps the fake process alive until it is told to shut down.
#[derive(Default)]
pub struct FakeLauncher {
    pub exits: Mutex<VecDeque<Option<ExitOutcome>>>,
    /// When set, `locate` reports the server as not installed.
    pub missing: bool,
    pub spawns: AtomicUsize,
    pub remediations: AtomicUsize,
    pub shutdowns: Arc<AtomicUsize>,
    pub stray_sweeps: AtomicUsize,
}

impl FakeLauncher {
    pub fn with_exits(exits: Vec<Option<ExitOutcome>>) -> Self {
        Self {
            exits: Mutex::new(exits.into()),
            ..Self::default()
        }
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn remediations(&self) -> usize {
        self.remediations.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    fn locate(&self) -> ServiceResult<PathBuf> {
        if self.missing {
            return Err(ServiceError::NotInstalled);
        }
        Ok(PathBuf::from("/opt/fake/tether-server"))
    }

    fn verify(&self, _path: &Path) -> ServiceResult<()> {
        Ok(())
    }

    async fn terminate_strays(&self) {
        self.stray_sweeps.fetch_add(1, Ordering::SeqCst);
    }

    async fn spawn(&self, _executable: &Path) -> ServiceResult<SpawnedServer> {
        let n = self.spawns.fetch_add(1, Ordering::SeqCst);
        let exit = self.exits.lock().unwrap().pop_front().flatten();
        let (events_tx, events_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let shutdowns = Arc::clone(&self.shutdowns);

        tokio::spawn(async move {
            let _ = events_tx
                .send(ServerEvent::Output("loading model weights".into()))
                .await;
            let outcome = match exit {
                Some(outcome) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    outcome
                }
                None => {
                    let _ = shutdown_rx.await;
                    shutdowns.fetch_add(1, Ordering::SeqCst);
                    ExitOutcome::signal(15)
                }
            };
            let _ = events_tx.send(ServerEvent::Exited(outcome)).await;
        });

        Ok(SpawnedServer::new(
            Some(1000 + n as u32),
            events_rx,
            shutdown_tx,
        ))
    }

    async fn remediate(&self, _executable: &Path) -> ServiceResult<()> {
        self.remediations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Supervisor timings shrunk to milliseconds.
pub fn fast_supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        max_launch_attempts: 3,
        restart_delay_ms: 10,
        startup_timeout_secs: 5,
        ready_poll_interval_ms: 10,
        health_cache_ms: 60_000,
        health_interval_secs: 3_600,
        probe_timeout_ms: 200,
        stop_grace_ms: 100,
        ..SupervisorConfig::default()
    }
}

pub fn supervisor(
    config: &SupervisorConfig,
    launcher: Arc<FakeLauncher>,
    probe: Arc<ScriptedProbe>,
) -> Supervisor {
    Supervisor::with_parts(config, launcher, probe)
}

/// Wait until the supervisor state satisfies `pred`, panicking after 5s.
pub async fn wait_for_state(
    supervisor: &Supervisor,
    pred: impl FnMut(&ServiceState) -> bool,
) -> ServiceState {
    let mut rx = supervisor.subscribe();
    let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for supervisor state")
        .expect("supervisor shut down");
    state.clone()
}

/// Poll `f` every few milliseconds until it returns true, panicking after 5s.
pub async fn eventually(mut f: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
