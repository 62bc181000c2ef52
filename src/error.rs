//! Error taxonomy shared by the supervisor and the inference client.
//!
//! Every variant carries a human-readable description; [`ServiceError::remedy`]
//! adds a suggested fix where one exists. Only [`ServiceError::ConnectionFailed`]
//! and [`ServiceError::ServerError`] are worth retrying.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("the local inference server is not installed")]
    NotInstalled,

    #[error("server executable not found (looked in {})", display_paths(.0))]
    ExecutableNotFound(Vec<PathBuf>),

    #[error("failed to launch the inference server: {0}")]
    LaunchFailed(String),

    #[error("port {0} is in use by a process that is not a compatible inference server")]
    PortConflict(u16),

    #[error("the inference server did not become ready within {0}s")]
    StartupTimeout(u64),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("could not connect to the inference server: {0}")]
    ConnectionFailed(String),

    #[error("inference server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid response from the inference server: {0}")]
    InvalidResponse(String),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    /// Transient network conditions are retried; everything else surfaces at once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::ServerError { .. })
    }

    /// A suggested next step for the user, if there is one.
    pub fn remedy(&self) -> Option<String> {
        match self {
            Self::NotInstalled | Self::ExecutableNotFound(_) => Some(
                "install the inference server, or set `supervisor.executable_path` in ~/.tether/config.toml"
                    .into(),
            ),
            Self::LaunchFailed(_) | Self::StartupTimeout(_) => {
                Some("start the service manually and check its log output".into())
            }
            Self::PortConflict(port) => Some(format!(
                "stop whatever is listening on port {port}, or configure a different `supervisor.port`"
            )),
            Self::ModelNotFound(name) => Some(format!("install the model with `tether pull {name}`")),
            Self::ConnectionFailed(_) => Some("make sure the inference server is running".into()),
            Self::PermissionDenied(_) => Some(
                "allow the server executable to run (check its permissions and code signature)".into(),
            ),
            Self::ServerError { .. } | Self::InvalidResponse(_) => None,
        }
    }

    /// Description plus remedy, suitable for showing to a user.
    pub fn user_message(&self) -> String {
        match self.remedy() {
            Some(remedy) => format!("{self}. Try: {remedy}"),
            None => self.to_string(),
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::ServerError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::ConnectionFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "no candidate locations".into();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ServiceError::ConnectionFailed("refused".into()).is_retryable());
        assert!(ServiceError::ServerError {
            status: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(!ServiceError::ModelNotFound("gemma3n".into()).is_retryable());
        assert!(!ServiceError::PermissionDenied("signing".into()).is_retryable());
        assert!(!ServiceError::InvalidResponse("garbage".into()).is_retryable());
    }

    #[test]
    fn model_not_found_suggests_pull() {
        let err = ServiceError::ModelNotFound("gemma3n:e2b".into());
        let msg = err.user_message();
        assert!(msg.contains("model not found: gemma3n:e2b"));
        assert!(msg.contains("tether pull gemma3n:e2b"));
    }

    #[test]
    fn executable_not_found_lists_candidates() {
        let err = ServiceError::ExecutableNotFound(vec![
            PathBuf::from("/a/server"),
            PathBuf::from("/b/server"),
        ]);
        assert!(err.to_string().contains("/a/server, /b/server"));
    }
}
