//! Exit classification and the recovery policy.
//!
//! The server is expected to run until stopped, so every exit is a failure.
//! A kill that looks like the OS refusing to run the binary (sandbox/signing
//! SIGKILL, or "cannot execute") earns one remediation and one relaunch per
//! session. Anything else is retried after a fixed delay until the launch cap.

use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use tracing::{info, warn};

use super::state::LaunchAttempts;
use crate::error::{ServiceError, ServiceResult};

const SIGKILL: i32 = 9;
/// Shells report "killed by signal N" as 128 + N.
const SIGKILL_EXIT_CODE: i32 = 128 + SIGKILL;
const CANNOT_EXECUTE_EXIT_CODE: i32 = 126;

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Killed outright, typically by code-signing or sandbox enforcement.
    SigningKill,
    /// The binary could not be executed.
    Permission,
    Crash,
}

impl ExitKind {
    pub fn needs_remediation(&self) -> bool {
        matches!(self, Self::SigningKill | Self::Permission)
    }
}

pub fn classify_exit(outcome: &ExitOutcome) -> ExitKind {
    match (outcome.signal, outcome.code) {
        (Some(SIGKILL), _) | (_, Some(SIGKILL_EXIT_CODE)) => ExitKind::SigningKill,
        (_, Some(CANNOT_EXECUTE_EXIT_CODE)) => ExitKind::Permission,
        _ => ExitKind::Crash,
    }
}

/// Launch-time errors map onto the same recovery paths as process exits.
/// Returns `None` for errors no relaunch can fix.
pub fn classify_launch_error(err: &ServiceError) -> Option<ExitKind> {
    match err {
        ServiceError::PermissionDenied(_) => Some(ExitKind::Permission),
        ServiceError::LaunchFailed(_) | ServiceError::StartupTimeout(_) => Some(ExitKind::Crash),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Fix permissions/signature, then relaunch once.
    Remediate,
    /// Relaunch after the delay.
    Retry { delay: Duration, attempt: u32 },
    /// Stop trying; the reason is shown to the user.
    GiveUp(String),
}

/// Decide what to do after a failure of `kind`, updating `attempts`.
pub fn plan_recovery(
    kind: ExitKind,
    attempts: &mut LaunchAttempts,
    restart_delay: Duration,
    cause: &str,
) -> RecoveryAction {
    if kind.needs_remediation() {
        if attempts.take_remediation() {
            return RecoveryAction::Remediate;
        }
        return RecoveryAction::GiveUp(format!(
            "{cause}; the server is still blocked after fixing its permissions and signature"
        ));
    }

    if attempts.record_failure() {
        return RecoveryAction::GiveUp(format!(
            "{cause}; gave up after {} launch attempts",
            attempts.max()
        ));
    }
    RecoveryAction::Retry {
        delay: restart_delay,
        attempt: attempts.failures() + 1,
    }
}

/// Make the server executable runnable again: mode bits, and on macOS the
/// quarantine attribute and an ad-hoc signature. Helper tool failures are
/// logged and otherwise ignored.
pub async fn remediate_executable(path: &Path) -> ServiceResult<()> {
    info!(path = %path.display(), "repairing server executable permissions");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| {
                ServiceError::PermissionDenied(format!(
                    "cannot change permissions of {}: {e}",
                    path.display()
                ))
            })?;
    }

    if cfg!(target_os = "macos") {
        let target = path.to_string_lossy().into_owned();
        run_helper("xattr", &["-dr", "com.apple.quarantine", &target]).await;
        run_helper("codesign", &["--force", "--deep", "--sign", "-", &target]).await;
    }
    Ok(())
}

async fn run_helper(program: &str, args: &[&str]) {
    match tokio::process::Command::new(program).args(args).output().await {
        Ok(out) if out.status.success() => {}
        Ok(out) => warn!(
            program,
            status = %out.status,
            stderr = %String::from_utf8_lossy(&out.stderr).trim(),
            "remediation helper failed"
        ),
        Err(e) => warn!(program, error = %e, "remediation helper could not run"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_classification() {
        assert_eq!(classify_exit(&ExitOutcome::signal(9)), ExitKind::SigningKill);
        assert_eq!(classify_exit(&ExitOutcome::code(137)), ExitKind::SigningKill);
        assert_eq!(classify_exit(&ExitOutcome::code(126)), ExitKind::Permission);
        assert_eq!(classify_exit(&ExitOutcome::code(1)), ExitKind::Crash);
        assert_eq!(classify_exit(&ExitOutcome::code(0)), ExitKind::Crash);
        assert_eq!(classify_exit(&ExitOutcome::signal(11)), ExitKind::Crash);
        assert_eq!(classify_exit(&ExitOutcome::default()), ExitKind::Crash);
    }

    #[test]
    fn signing_kill_remediates_once() {
        let mut attempts = LaunchAttempts::new(3);
        let delay = Duration::from_millis(10);
        assert_eq!(
            plan_recovery(ExitKind::SigningKill, &mut attempts, delay, "killed"),
            RecoveryAction::Remediate
        );
        assert!(matches!(
            plan_recovery(ExitKind::SigningKill, &mut attempts, delay, "killed"),
            RecoveryAction::GiveUp(_)
        ));
    }

    #[test]
    fn crashes_retry_until_cap() {
        let mut attempts = LaunchAttempts::new(3);
        let delay = Duration::from_millis(10);
        assert_eq!(
            plan_recovery(ExitKind::Crash, &mut attempts, delay, "crashed"),
            RecoveryAction::Retry { delay, attempt: 2 }
        );
        assert_eq!(
            plan_recovery(ExitKind::Crash, &mut attempts, delay, "crashed"),
            RecoveryAction::Retry { delay, attempt: 3 }
        );
        match plan_recovery(ExitKind::Crash, &mut attempts, delay, "crashed") {
            RecoveryAction::GiveUp(reason) => assert!(reason.contains("3 launch attempts")),
            other => panic!("expected GiveUp, got {other:?}"),
        }
    }

    #[test]
    fn launch_errors_map_to_recovery_paths() {
        assert_eq!(
            classify_launch_error(&ServiceError::PermissionDenied("x".into())),
            Some(ExitKind::Permission)
        );
        assert_eq!(
            classify_launch_error(&ServiceError::StartupTimeout(120)),
            Some(ExitKind::Crash)
        );
        assert_eq!(classify_launch_error(&ServiceError::PortConflict(11435)), None);
        assert_eq!(classify_launch_error(&ServiceError::NotInstalled), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn remediation_sets_executable_bits() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether-server");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        remediate_executable(&path).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
