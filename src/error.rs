//! Engine-wide error taxonomy.
//!
//! Every fallible operation across the watcher, executor, scheduler, and
//! registry/runtime adapters resolves to one of these kinds. The kind alone
//! decides retry behavior (`retryable`); callers should not pattern-match on
//! message text.

use thiserror::Error;

/// The single error type returned by engine operations.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether the operation that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

/// Error taxonomy from spec §7. `retryable()` is a property of the kind, not
/// the instance — do not special-case individual messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RegistryUnavailable,
    AuthFailed,
    ImageNotFound,
    ImageCorrupt,
    RuntimeUnavailable,
    RuntimeConflict,
    HealthCheckFailed,
    HookFailed,
    RollbackFailed,
    Timeout,
    Cancelled,
    DependencyCycle,
    Conflict,
    InvalidConfig,
    NotFound,
    AlreadyTerminal,
    NameConflict,
    PolicyDisabled,
    EmptyTargets,
    ContainerBusy,
    InternalError,
}

impl ErrorKind {
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RegistryUnavailable
                | ErrorKind::ImageCorrupt
                | ErrorKind::RuntimeUnavailable
                | ErrorKind::HealthCheckFailed
                | ErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::RegistryUnavailable => "registry_unavailable",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::ImageNotFound => "image_not_found",
            ErrorKind::ImageCorrupt => "image_corrupt",
            ErrorKind::RuntimeUnavailable => "runtime_unavailable",
            ErrorKind::RuntimeConflict => "runtime_conflict",
            ErrorKind::HealthCheckFailed => "health_check_failed",
            ErrorKind::HookFailed => "hook_failed",
            ErrorKind::RollbackFailed => "rollback_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DependencyCycle => "dependency_cycle",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyTerminal => "already_terminal",
            ErrorKind::NameConflict => "name_conflict",
            ErrorKind::PolicyDisabled => "policy_disabled",
            ErrorKind::EmptyTargets => "empty_targets",
            ErrorKind::ContainerBusy => "container_busy",
            ErrorKind::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(e: bollard::errors::Error) -> Self {
        let kind = match &e {
            bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                ErrorKind::NotFound
            }
            bollard::errors::Error::DockerResponseServerError { status_code: 409, .. } => {
                ErrorKind::RuntimeConflict
            }
            bollard::errors::Error::DockerResponseServerError { status_code, .. }
                if *status_code >= 500 =>
            {
                ErrorKind::RuntimeUnavailable
            }
            _ => ErrorKind::RuntimeUnavailable,
        };
        EngineError::with_source(kind, "container runtime call failed", e)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::RegistryUnavailable.retryable());
        assert!(ErrorKind::HealthCheckFailed.retryable());
        assert!(!ErrorKind::AuthFailed.retryable());
        assert!(!ErrorKind::RollbackFailed.retryable());
    }

    #[test]
    fn display_matches_snake_case() {
        assert_eq!(ErrorKind::ImageNotFound.to_string(), "image_not_found");
    }
}
