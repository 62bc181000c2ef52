//! Process supervisor for the local inference server.
//!
//! One actor task owns the child process, the lifecycle state, the health
//! cache and the timers; [`Supervisor`] handles talk to it over a command
//! channel, so `start`, `stop` and the periodic health check never interleave.
//! The launch sequence itself (port probe, locate, spawn, readiness polling)
//! runs on a separate task that reports back to the actor and is aborted when
//! a newer launch or a `stop` supersedes it. State and a human-readable status
//! line are published on `watch` channels.

pub mod health;
pub mod launcher;
pub mod recovery;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{ServiceError, ServiceResult};
pub use health::{HealthCache, HealthProbe, HttpHealthProbe, ProbeOutcome};
pub use launcher::{Launcher, ProcessLauncher, ServerEvent, SpawnedServer};
pub use recovery::{ExitKind, ExitOutcome};
pub use state::{LaunchAttempts, ServiceState};

use recovery::{classify_exit, classify_launch_error, plan_recovery, RecoveryAction};

const COMMAND_CAPACITY: usize = 16;
const EVENT_CAPACITY: usize = 32;

enum Command {
    Start { reply: oneshot::Sender<()> },
    Stop { reply: oneshot::Sender<()> },
    CheckHealth { reply: oneshot::Sender<ServiceState> },
}

/// Progress reported by a launch task.
enum LaunchEvent {
    /// A compatible server already owns the port.
    Adopted(ProbeOutcome),
    Spawned(SpawnedServer),
    Probe(ProbeOutcome),
    Failed(ServiceError),
}

/// Cloneable handle to the supervisor actor. The actor shuts the server down
/// once the last handle is dropped.
#[derive(Clone)]
pub struct Supervisor {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ServiceState>,
    status: watch::Receiver<String>,
}

impl Supervisor {
    /// Supervise the real server binary described by `config`.
    pub fn new(config: &SupervisorConfig) -> ServiceResult<Self> {
        let probe = HttpHealthProbe::new(config)?;
        Ok(Self::with_parts(
            config,
            Arc::new(ProcessLauncher::new(config.clone())),
            Arc::new(probe),
        ))
    }

    /// Build with explicit launcher and probe. Must be called inside a Tokio runtime.
    pub fn with_parts(
        config: &SupervisorConfig,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state) = watch::channel(ServiceState::NotRunning);
        let (status_tx, status) = watch::channel(String::from("Not running"));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        let actor = Actor {
            config: config.clone(),
            launcher,
            probe,
            commands: command_rx,
            events_tx,
            events_rx,
            state_tx,
            status_tx,
            attempts: LaunchAttempts::new(config.max_launch_attempts),
            cache: HealthCache::new(config.health_cache_window()),
            generation: 0,
            launch_task: None,
            server: None,
            retry_at: None,
            health_timer: None,
        };
        tokio::spawn(actor.run());

        Self {
            commands,
            state,
            status,
        }
    }

    /// Bring the server up. A no-op while a launch is in flight or the server
    /// is already serving; from `NotRunning` or `Error` the attempt budget is reset.
    pub async fn start(&self) -> ServiceResult<()> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Terminate the server, cancel any launch in flight and stop health checks.
    pub async fn stop(&self) -> ServiceResult<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Probe the server (or reuse a result from the cache window) and return
    /// the resulting state.
    pub async fn check_health(&self) -> ServiceResult<ServiceState> {
        self.request(|reply| Command::CheckHealth { reply }).await
    }

    pub fn state(&self) -> ServiceState {
        self.state.borrow().clone()
    }

    pub fn status_message(&self) -> String {
        self.status.borrow().clone()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<String> {
        self.status.clone()
    }

    /// Wait until the server is `Ready`. Fails on `Error` or when `timeout` passes.
    pub async fn wait_until_ready(&self, timeout: Duration) -> ServiceResult<()> {
        let mut rx = self.state.clone();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ServiceState::Ready | ServiceState::Error(_))),
        )
        .await;

        match settled {
            Err(_) => Err(ServiceError::StartupTimeout(timeout.as_secs())),
            Ok(Err(_)) => Err(actor_gone()),
            Ok(Ok(state)) => match &*state {
                ServiceState::Error(reason) => Err(ServiceError::LaunchFailed(reason.clone())),
                _ => Ok(()),
            },
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> ServiceResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())
    }
}

fn actor_gone() -> ServiceError {
    ServiceError::LaunchFailed("the supervisor has shut down".into())
}

struct Actor {
    config: SupervisorConfig,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn HealthProbe>,
    commands: mpsc::Receiver<Command>,
    // the actor keeps a sender so the event channel never closes
    events_tx: mpsc::Sender<(u64, LaunchEvent)>,
    events_rx: mpsc::Receiver<(u64, LaunchEvent)>,
    state_tx: watch::Sender<ServiceState>,
    status_tx: watch::Sender<String>,
    attempts: LaunchAttempts,
    cache: HealthCache,
    /// Bumped whenever a launch task is started or abandoned; events from
    /// older generations are ignored.
    generation: u64,
    launch_task: Option<JoinHandle<()>>,
    server: Option<SpawnedServer>,
    retry_at: Option<Instant>,
    health_timer: Option<Interval>,
}

impl Actor {
    async fn run(mut self) {
        debug!("supervisor running");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some((generation, event)) = self.events_rx.recv() => {
                    if generation == self.generation {
                        self.handle_launch_event(event).await;
                    } else {
                        debug!(generation, current = self.generation, "ignoring stale launch event");
                    }
                }
                event = next_server_event(&mut self.server) => self.handle_server_event(event).await,
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    self.begin_launch(false);
                }
                _ = next_tick(&mut self.health_timer) => {
                    self.check_health().await;
                }
            }
        }

        self.stop().await;
        debug!("supervisor shut down");
    }

    fn current(&self) -> ServiceState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, state: ServiceState, status: impl Into<String>) {
        let status = status.into();
        if *self.state_tx.borrow() != state {
            info!(state = %state, status = %status, "service state changed");
        }
        // status first, so a state watcher never reads the previous status
        self.status_tx.send_replace(status);
        self.state_tx.send_replace(state);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { reply } => {
                self.start();
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::CheckHealth { reply } => {
                let state = self.check_health().await;
                let _ = reply.send(state);
            }
        }
    }

    fn start(&mut self) {
        let state = self.current();
        if state.is_active() {
            debug!(state = %state, "start ignored, server already active");
            return;
        }
        self.attempts.reset();
        self.begin_launch(false);
    }

    async fn stop(&mut self) {
        self.abort_launch();
        self.retry_at = None;
        self.health_timer = None;
        self.cache.invalidate();
        self.release_server().await;
        self.attempts.reset();
        self.set_state(ServiceState::NotRunning, "Stopped");
    }

    async fn check_health(&mut self) -> ServiceState {
        if self.cache.get().is_none() {
            let outcome = self.probe.probe().await;
            if self.current().is_active() {
                self.apply_probe(outcome).await;
            } else {
                // not supervising anything; remember the answer, change nothing
                self.cache.put(outcome);
            }
        }
        self.current()
    }

    fn begin_launch(&mut self, remediate: bool) {
        self.abort_launch();
        self.retry_at = None;
        self.set_state(ServiceState::Launching, "Starting inference server");

        let ctx = LaunchContext {
            launcher: Arc::clone(&self.launcher),
            probe: Arc::clone(&self.probe),
            port: self.config.port,
            startup_timeout: self.config.startup_timeout(),
            poll_interval: self.config.ready_poll_interval(),
            remediate,
        };
        let reporter = Reporter {
            generation: self.generation,
            tx: self.events_tx.clone(),
        };
        self.launch_task = Some(tokio::spawn(launch_sequence(ctx, reporter)));
    }

    /// Cancel the launch task, if any, and disown its pending events.
    fn abort_launch(&mut self) {
        if let Some(task) = self.launch_task.take() {
            task.abort();
        }
        self.generation += 1;
    }

    async fn release_server(&mut self) {
        if let Some(server) = self.server.take() {
            let pid = server.pid;
            match server.stop(self.config.stop_grace()).await {
                Some(outcome) => info!(pid = ?pid, outcome = %outcome, "inference server stopped"),
                None => warn!(pid = ?pid, "inference server did not confirm shutdown"),
            }
        }
    }

    async fn handle_launch_event(&mut self, event: LaunchEvent) {
        match event {
            LaunchEvent::Adopted(outcome) => {
                info!(port = self.config.port, "using the server already listening on the port");
                self.apply_probe(outcome).await;
            }
            LaunchEvent::Spawned(server) => {
                self.server = Some(server);
                self.set_state(ServiceState::Loading, "Waiting for the model to load");
            }
            LaunchEvent::Probe(outcome) => self.apply_probe(outcome).await,
            LaunchEvent::Failed(err) => {
                self.launch_task = None;
                warn!(error = %err, "launch failed");
                self.release_server().await;
                match classify_launch_error(&err) {
                    Some(kind) => self.recover(kind, &err.to_string()),
                    None => self.fail(err.user_message()),
                }
            }
        }
    }

    async fn apply_probe(&mut self, outcome: ProbeOutcome) {
        self.cache.put(outcome.clone());
        match outcome {
            ProbeOutcome::Healthy => {
                // the launch task ends on its own after a healthy probe
                self.launch_task = None;
                // a server is answering; a restart scheduled before this is moot
                self.retry_at = None;
                self.attempts.record_ready();
                self.set_state(ServiceState::Ready, "Ready");
                self.ensure_health_timer();
            }
            ProbeOutcome::Loading { progress: Some(progress) } => {
                self.set_state(
                    ServiceState::DownloadingModel(progress),
                    format!("Downloading model ({:.0}%)", progress * 100.0),
                );
            }
            ProbeOutcome::Loading { progress: None } => {
                if self.current() != ServiceState::Loading {
                    self.set_state(ServiceState::Loading, "Loading model...");
                }
            }
            ProbeOutcome::Failed(reason) => {
                self.abort_launch();
                self.release_server().await;
                self.fail(reason);
            }
            ProbeOutcome::Unreachable | ProbeOutcome::Foreign => {
                // while launching, the readiness loop owns these answers
                if self.current().is_serving() && self.launch_task.is_none() {
                    warn!(outcome = ?outcome, "health probe failed while serving");
                    self.health_timer = None;
                    self.release_server().await;
                    self.recover(ExitKind::Crash, "the server stopped answering health probes");
                }
            }
        }
    }

    async fn handle_server_event(&mut self, event: Option<ServerEvent>) {
        let outcome = match event {
            Some(ServerEvent::Output(line)) => {
                if let Some(hint) = launcher::status_hint(&line) {
                    if !self.current().is_serving() {
                        self.status_tx.send_replace(hint.to_string());
                    }
                }
                return;
            }
            Some(ServerEvent::Exited(outcome)) => outcome,
            None => ExitOutcome::default(),
        };

        self.server = None;
        self.abort_launch();
        self.health_timer = None;
        self.cache.invalidate();

        let kind = classify_exit(&outcome);
        warn!(outcome = %outcome, kind = ?kind, "inference server exited");
        self.recover(kind, &format!("the server exited with {outcome}"));
    }

    fn recover(&mut self, kind: ExitKind, cause: &str) {
        match plan_recovery(kind, &mut self.attempts, self.config.restart_delay(), cause) {
            RecoveryAction::Remediate => {
                warn!(cause, "attempting one-time permission remediation");
                self.begin_launch(true);
            }
            RecoveryAction::Retry { delay, attempt } => {
                info!(
                    attempt,
                    max_attempts = self.attempts.max(),
                    delay_ms = delay.as_millis() as u64,
                    "restarting inference server"
                );
                self.abort_launch();
                self.retry_at = Some(Instant::now() + delay);
                self.set_state(
                    ServiceState::Launching,
                    format!("Restarting (attempt {attempt} of {})", self.attempts.max()),
                );
            }
            RecoveryAction::GiveUp(reason) => self.fail(reason),
        }
    }

    fn fail(&mut self, reason: String) {
        error!(reason = %reason, "inference server unavailable");
        self.abort_launch();
        self.retry_at = None;
        self.health_timer = None;
        self.set_state(ServiceState::Error(reason.clone()), reason);
    }

    fn ensure_health_timer(&mut self) {
        if self.health_timer.is_none() {
            let period = self.config.health_interval();
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.health_timer = Some(timer);
        }
    }
}

async fn next_server_event(server: &mut Option<SpawnedServer>) -> Option<ServerEvent> {
    match server {
        Some(server) => server.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

struct LaunchContext {
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn HealthProbe>,
    port: u16,
    startup_timeout: Duration,
    poll_interval: Duration,
    remediate: bool,
}

struct Reporter {
    generation: u64,
    tx: mpsc::Sender<(u64, LaunchEvent)>,
}

impl Reporter {
    async fn send(&self, event: LaunchEvent) {
        let _ = self.tx.send((self.generation, event)).await;
    }
}

async fn launch_sequence(ctx: LaunchContext, reporter: Reporter) {
    match ctx.probe.probe().await {
        ProbeOutcome::Unreachable => {}
        ProbeOutcome::Foreign => {
            reporter
                .send(LaunchEvent::Failed(ServiceError::PortConflict(ctx.port)))
                .await;
            return;
        }
        outcome => {
            let settled = matches!(outcome, ProbeOutcome::Healthy | ProbeOutcome::Failed(_));
            reporter.send(LaunchEvent::Adopted(outcome)).await;
            if !settled {
                poll_until_ready(&ctx, &reporter).await;
            }
            return;
        }
    }

    let executable = match ctx.launcher.locate() {
        Ok(path) => path,
        Err(e) => {
            reporter.send(LaunchEvent::Failed(e)).await;
            return;
        }
    };

    if ctx.remediate {
        if let Err(e) = ctx.launcher.remediate(&executable).await {
            warn!(error = %e, "remediation failed");
        }
    }

    if let Err(e) = ctx.launcher.verify(&executable) {
        reporter.send(LaunchEvent::Failed(e)).await;
        return;
    }

    ctx.launcher.terminate_strays().await;

    match ctx.launcher.spawn(&executable).await {
        Ok(server) => reporter.send(LaunchEvent::Spawned(server)).await,
        Err(e) => {
            reporter.send(LaunchEvent::Failed(e)).await;
            return;
        }
    }

    poll_until_ready(&ctx, &reporter).await;
}

/// Probe until healthy, failed, or out of time. Download progress pushes the
/// deadline out, since fetching weights can outlast any fixed timeout.
async fn poll_until_ready(ctx: &LaunchContext, reporter: &Reporter) {
    let mut deadline = Instant::now() + ctx.startup_timeout;
    loop {
        tokio::time::sleep(ctx.poll_interval).await;
        if Instant::now() >= deadline {
            reporter
                .send(LaunchEvent::Failed(ServiceError::StartupTimeout(
                    ctx.startup_timeout.as_secs(),
                )))
                .await;
            return;
        }

        let outcome = ctx.probe.probe().await;
        let settled = matches!(outcome, ProbeOutcome::Healthy | ProbeOutcome::Failed(_));
        if matches!(outcome, ProbeOutcome::Loading { progress: Some(_) }) {
            deadline = Instant::now() + ctx.startup_timeout;
        }
        reporter.send(LaunchEvent::Probe(outcome)).await;
        if settled {
            return;
        }
    }
}
