//! Locating, spawning, and stopping the server process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::recovery::{remediate_executable, ExitOutcome};
use crate::config::{default_tether_dir, expand_tilde, SupervisorConfig};
use crate::error::{ServiceError, ServiceResult};

/// Output lines buffered per process before new ones are dropped.
const OUTPUT_CAPACITY: usize = 256;

/// Something the running process did.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// One line of stdout or stderr.
    Output(String),
    Exited(ExitOutcome),
}

/// Handle to a spawned server. Dropping it terminates the process.
pub struct SpawnedServer {
    pub pid: Option<u32>,
    events: mpsc::Receiver<ServerEvent>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl SpawnedServer {
    /// `events` must end with [`ServerEvent::Exited`]; `shutdown` asks the
    /// owner of the process to stop it.
    pub fn new(
        pid: Option<u32>,
        events: mpsc::Receiver<ServerEvent>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            pid,
            events,
            shutdown: Some(shutdown),
        }
    }

    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Ask the process to stop and wait for it to exit.
    pub async fn stop(mut self, grace: Duration) -> Option<ExitOutcome> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        // the watcher escalates to a kill after `grace`; allow it time to report
        let deadline = grace + Duration::from_secs(2);
        tokio::time::timeout(deadline, async {
            while let Some(event) = self.events.recv().await {
                if let ServerEvent::Exited(outcome) = event {
                    return Some(outcome);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }
}

/// The process-level operations of a launch.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// First existing executable from the candidate list.
    fn locate(&self) -> ServiceResult<PathBuf>;

    /// Fails with `PermissionDenied` if `path` cannot be executed.
    fn verify(&self, path: &Path) -> ServiceResult<()>;

    /// Kill leftovers from a previous run that would hold the port.
    async fn terminate_strays(&self);

    async fn spawn(&self, executable: &Path) -> ServiceResult<SpawnedServer>;

    /// Repair permissions/signature after the OS refused to run the binary.
    async fn remediate(&self, executable: &Path) -> ServiceResult<()>;
}

/// Launches the real server binary as a child process.
pub struct ProcessLauncher {
    config: SupervisorConfig,
}

impl ProcessLauncher {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// Candidate locations in priority order: configured path, the bundled
    /// install, next to our own binary, system locations, then a developer
    /// checkout in the working directory.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let name = executable_file_name(&self.config.executable_name);
        let mut candidates = Vec::new();

        if let Some(path) = &self.config.executable_path {
            candidates.push(expand_tilde(path));
        }
        candidates.push(default_tether_dir().join("bin").join(&name));
        if let Some(dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
            candidates.push(dir.join(&name));
        }
        for dir in ["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin"] {
            candidates.push(Path::new(dir).join(&name));
        }
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join("server").join(&name));
        }
        candidates
    }
}

fn executable_file_name(name: &str) -> String {
    if cfg!(windows) && !name.ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    /// A configured path that does not exist is `ExecutableNotFound`; with no
    /// configured path and nothing at any built-in location the server is
    /// `NotInstalled`.
    fn locate(&self) -> ServiceResult<PathBuf> {
        let candidates = self.candidates();
        match candidates.iter().find(|p| p.is_file()) {
            Some(path) => {
                debug!(path = %path.display(), "found server executable");
                Ok(path.clone())
            }
            None if self.config.executable_path.is_some() => {
                Err(ServiceError::ExecutableNotFound(candidates))
            }
            None => Err(ServiceError::NotInstalled),
        }
    }

    fn verify(&self, path: &Path) -> ServiceResult<()> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            ServiceError::PermissionDenied(format!("cannot inspect {}: {e}", path.display()))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(ServiceError::PermissionDenied(format!(
                    "{} is not executable",
                    path.display()
                )));
            }
        }
        #[cfg(not(unix))]
        let _ = metadata;
        Ok(())
    }

    async fn terminate_strays(&self) {
        let name = executable_file_name(&self.config.executable_name);
        let result = if cfg!(windows) {
            Command::new("taskkill")
                .args(["/F", "/IM", &name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
        } else {
            Command::new("pkill")
                .args(["-x", &name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
        };
        match result {
            // pkill exits 1 when nothing matched
            Ok(status) if status.success() => info!(name = %name, "terminated stray server processes"),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "stray process cleanup unavailable"),
        }
    }

    async fn spawn(&self, executable: &Path) -> ServiceResult<SpawnedServer> {
        let cache_dir = expand_tilde(&self.config.model_cache_dir);
        tokio::fs::create_dir_all(&cache_dir).await.map_err(|e| {
            ServiceError::LaunchFailed(format!(
                "cannot create model cache {}: {e}",
                cache_dir.display()
            ))
        })?;

        let mut child = Command::new(executable)
            .args(&self.config.args)
            .env("HF_HOME", &cache_dir)
            .env("TRANSFORMERS_CACHE", &cache_dir)
            .env("TORCH_HOME", &cache_dir)
            .env("TOKENIZERS_PARALLELISM", "false")
            .env("PYTORCH_ENABLE_MPS_FALLBACK", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => ServiceError::PermissionDenied(format!(
                    "cannot execute {}: {e}",
                    executable.display()
                )),
                _ => ServiceError::LaunchFailed(format!("{}: {e}", executable.display())),
            })?;

        let pid = child.id();
        info!(pid = ?pid, path = %executable.display(), "spawned inference server");

        let (tx, rx) = mpsc::channel(OUTPUT_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout", tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr", tx.clone()));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(watch_exit(child, shutdown_rx, self.config.stop_grace(), tx));

        Ok(SpawnedServer::new(pid, rx, shutdown_tx))
    }

    async fn remediate(&self, executable: &Path) -> ServiceResult<()> {
        remediate_executable(executable).await
    }
}

/// Re-emit process output as log events and hand it to the supervisor.
async fn forward_output<R>(stream: R, name: &'static str, tx: mpsc::Sender<ServerEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(target: "tether::server", stream = name, "{line}");
                // a slow supervisor loses output lines, never the exit event
                let _ = tx.try_send(ServerEvent::Output(line));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(stream = name, error = %e, "server output closed");
                break;
            }
        }
    }
}

async fn watch_exit(
    mut child: Child,
    shutdown: oneshot::Receiver<()>,
    grace: Duration,
    tx: mpsc::Sender<ServerEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // a dropped handle counts as a shutdown request
        _ = shutdown => terminate(&mut child, grace).await,
    };

    let outcome = match status {
        Ok(status) => ExitOutcome::from(status),
        Err(e) => {
            warn!(error = %e, "failed to wait on server process");
            ExitOutcome::default()
        }
    };
    let _ = tx.send(ServerEvent::Exited(outcome)).await;
}

/// Graceful signal, then a forced kill once `grace` runs out.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<std::process::ExitStatus> {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            let _ = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await;
        }
        #[cfg(windows)]
        {
            let _ = Command::new("taskkill")
                .args(["/PID", &pid.to_string()])
                .status()
                .await;
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(grace_ms = grace.as_millis() as u64, "server ignored shutdown signal, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Status text suggested by a line of server output, if it matters.
pub fn status_hint(line: &str) -> Option<&'static str> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("download") {
        Some("Downloading model...")
    } else if lower.contains("loading") {
        Some("Loading model...")
    } else {
        None
    }
}
