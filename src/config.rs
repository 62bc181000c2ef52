use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TetherConfig {
    pub log: LogConfig,
    pub supervisor: SupervisorConfig,
    pub client: ClientConfig,
    pub memory: MemoryConfig,
    pub context: ContextConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

/// How the local inference server is located, launched, and watched.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub models_path: String,
    /// File name of the server executable, also used to find stray processes.
    pub executable_name: String,
    /// Explicit executable location; checked before any of the built-in candidates.
    pub executable_path: Option<String>,
    /// Extra arguments passed to the server on launch.
    pub args: Vec<String>,
    pub model_cache_dir: String,
    pub max_launch_attempts: u32,
    pub restart_delay_ms: u64,
    pub startup_timeout_secs: u64,
    pub ready_poll_interval_ms: u64,
    pub health_cache_ms: u64,
    pub health_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub stop_grace_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address. When unset the client follows `[supervisor] host` and `port`;
    /// when set, the supervisor watches this address instead.
    pub base_url: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    pub request_timeout_secs: u64,
    pub health_cache_ms: u64,
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    pub db_path: String,
    pub archive_dir: String,
    pub max_memories: usize,
    pub default_search_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ContextConfig {
    pub system_prompt: String,
    pub memory_limit: usize,
    pub recent_entries: usize,
    pub history_messages: usize,
    pub entry_preview_chars: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let model_cache_dir = default_tether_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            host: "127.0.0.1".into(),
            port: 11435,
            health_path: "/api/health".into(),
            models_path: "/api/tags".into(),
            executable_name: "tether-server".into(),
            executable_path: None,
            args: Vec::new(),
            model_cache_dir,
            max_launch_attempts: 3,
            restart_delay_ms: 2_000,
            startup_timeout_secs: 120,
            ready_poll_interval_ms: 1_000,
            health_cache_ms: 5_000,
            health_interval_secs: 30,
            probe_timeout_ms: 2_000,
            stop_grace_ms: 5_000,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            chat_model: "gemma3n:e2b".into(),
            embedding_model: "nomic-embed-text".into(),
            request_timeout_secs: 120,
            health_cache_ms: 5_000,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let dir = default_tether_dir();
        Self {
            db_path: dir.join("memory.db").to_string_lossy().into_owned(),
            archive_dir: dir.join("archive").to_string_lossy().into_owned(),
            max_memories: 1_000,
            default_search_limit: 5,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a warm, private journaling companion running entirely on this \
                            device. Be concise, supportive, and honest."
                .into(),
            memory_limit: 5,
            recent_entries: 3,
            history_messages: 10,
            entry_preview_chars: 280,
        }
    }
}

impl SupervisorConfig {
    /// Base URL the supervised server listens on.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn health_cache_window(&self) -> Duration {
        Duration::from_millis(self.health_cache_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Returns `~/.tether/`
pub fn default_tether_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".tether")
}

/// Returns the default config file path: `~/.tether/config.toml`
pub fn default_config_path() -> PathBuf {
    default_tether_dir().join("config.toml")
}

impl TetherConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            TetherConfig::default()
        };

        config.apply_env_overrides();
        config.resolve_server_address()?;
        Ok(config)
    }

    /// Point the client and the supervisor at one server. An explicit
    /// `client.base_url` moves the supervisor's host and port to match it.
    pub fn resolve_server_address(&mut self) -> Result<()> {
        let Some(raw) = self.client.base_url.as_deref() else {
            return Ok(());
        };
        let url = reqwest::Url::parse(raw)
            .with_context(|| format!("invalid server address {raw:?}"))?;
        let host = url
            .host_str()
            .with_context(|| format!("server address {raw:?} has no host"))?;
        let port = url
            .port_or_known_default()
            .with_context(|| format!("server address {raw:?} has no port"))?;
        self.supervisor.host = host.to_string();
        self.supervisor.port = port;
        Ok(())
    }

    /// The one address both the client and the supervisor talk to.
    pub fn server_url(&self) -> String {
        match &self.client.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => self.supervisor.base_url(),
        }
    }

    /// Apply environment variable overrides
    /// (TETHER_BASE_URL, TETHER_MODEL, TETHER_DB, TETHER_LOG_LEVEL, TETHER_SERVER_BIN).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TETHER_BASE_URL") {
            self.client.base_url = Some(val);
        }
        if let Ok(val) = std::env::var("TETHER_MODEL") {
            self.client.chat_model = val;
        }
        if let Ok(val) = std::env::var("TETHER_DB") {
            self.memory.db_path = val;
        }
        if let Ok(val) = std::env::var("TETHER_LOG_LEVEL") {
            self.log.level = val;
        }
        if let Ok(val) = std::env::var("TETHER_SERVER_BIN") {
            self.supervisor.executable_path = Some(val);
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.memory.db_path)
    }

    pub fn resolved_archive_dir(&self) -> PathBuf {
        expand_tilde(&self.memory.archive_dir)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
