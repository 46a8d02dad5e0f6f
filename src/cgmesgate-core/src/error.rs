//! Error kinds surfaced by the ingestion and orchestration core.
//!
//! Every request-level failure maps to exactly one variant. Callers (HTTP
//! layer, cgv) use [`Error::kind`] as a stable machine-readable name.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::gate::ValidationGate;
use crate::readiness::ReadinessState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or hostile archive: size limit, traversal, bad entry type.
    #[error("archive rejected: {0}")]
    Archive(String),

    /// A file name failed the allow-list.
    #[error("file name rejected: {0}")]
    Sanitization(String),

    #[error("system not ready for validation (state: {0})")]
    SystemNotReady(ReadinessState),

    #[error("another RSL installation is already in progress")]
    InstallInProgress,

    /// Another service already owns the data directory.
    #[error("data directory {} is in use by another process", .0.display())]
    DataDirLocked(PathBuf),

    #[error("invalid input for gate {gate}: {reason}")]
    InvalidGateInput {
        gate: ValidationGate,
        reason: String,
    },

    #[error("capacity exceeded: {running} running, {queued} queued (max running {max_running})")]
    CapacityExceeded {
        running: usize,
        queued: usize,
        max_running: usize,
    },

    #[error("validation engine failed: {0}")]
    EngineExecution(String),

    #[error("process exceeded wall-clock timeout of {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("report conversion failed: {0}")]
    Conversion(String),

    /// Host-level failure to allocate or reclaim a workspace directory.
    #[error("workspace error at {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable snake_case name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Archive(_) => "archive_error",
            Error::Sanitization(_) => "sanitization_error",
            Error::SystemNotReady(_) => "system_not_ready",
            Error::InstallInProgress => "install_in_progress",
            Error::DataDirLocked(_) => "data_dir_locked",
            Error::InvalidGateInput { .. } => "invalid_gate_input",
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::EngineExecution(_) => "engine_execution_error",
            Error::Timeout(_) => "timeout_error",
            Error::Conversion(_) => "conversion_error",
            Error::Workspace { .. } => "workspace_error",
            Error::Io(_) => "io_error",
        }
    }

    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Workspace {
            path: path.into(),
            source,
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => Error::Io(e),
            other => Error::Archive(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(Error::Archive("x".into()).kind(), "archive_error");
        assert_eq!(Error::InstallInProgress.kind(), "install_in_progress");
        assert_eq!(
            Error::SystemNotReady(ReadinessState::NotReady).kind(),
            "system_not_ready"
        );
        assert_eq!(Error::Timeout(Duration::from_secs(3)).kind(), "timeout_error");
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::InvalidGateInput {
            gate: ValidationGate::FullCgm,
            reason: "no boundary file".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("full_cgm"));
        assert!(msg.contains("no boundary file"));

        let err = Error::Timeout(Duration::from_secs(1200));
        assert!(err.to_string().contains("1200s"));
    }
}
