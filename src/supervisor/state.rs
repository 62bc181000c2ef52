//! Service lifecycle states and the launch-attempt counter.

/// Where the supervised server is in its lifecycle. Exactly one is current.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ServiceState {
    #[default]
    NotRunning,
    /// A launch sequence is in flight (or waiting out a restart delay).
    Launching,
    /// The process is up but has not reported a loaded model yet.
    Loading,
    /// The server is fetching model weights; progress is in `[0, 1]`.
    DownloadingModel(f64),
    Ready,
    /// Gave up; needs an explicit `start()` to try again.
    Error(String),
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRunning => "not_running",
            Self::Launching => "launching",
            Self::Loading => "loading",
            Self::DownloadingModel(_) => "downloading_model",
            Self::Ready => "ready",
            Self::Error(_) => "error",
        }
    }

    /// States in which a `start()` call has nothing to do.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Launching | Self::Loading | Self::DownloadingModel(_) | Self::Ready
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// States that promise a health probe answered within the cache window.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Ready | Self::DownloadingModel(_))
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DownloadingModel(p) => write!(f, "downloading_model({:.0}%)", p * 100.0),
            Self::Error(reason) => write!(f, "error({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Consecutive failed launches, plus whether the one-shot permission
/// remediation has been spent in this supervision session.
#[derive(Debug, Clone)]
pub struct LaunchAttempts {
    failures: u32,
    max: u32,
    remediated: bool,
}

impl LaunchAttempts {
    pub fn new(max: u32) -> Self {
        Self {
            failures: 0,
            max: max.max(1),
            remediated: false,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Count one failed launch. Returns `true` once the cap is reached.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.failures >= self.max
    }

    /// A `Ready` transition clears the failure count but not the remediation flag.
    pub fn record_ready(&mut self) {
        self.failures = 0;
    }

    /// Claim the remediation. Returns `false` if it was already used.
    pub fn take_remediation(&mut self) -> bool {
        !std::mem::replace(&mut self.remediated, true)
    }

    /// Explicit user action: start over with a full budget.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.remediated = false;
    }
}
