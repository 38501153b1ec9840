//! Central error type for the reactive core.
//!
//! Every fallible operation across the crate returns [`CoreResult`]. Errors
//! are plain values; they are never thrown across component boundaries.
//! Each variant carries a stable machine-readable code (see
//! [`CoreError::code`]) alongside the human-readable message produced by
//! `Display`.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Stage of the reload pipeline that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStage {
    Parse,
    Validate,
    Install,
    Rollback,
}

/// Errors produced by the state store, command engine, file watcher and
/// hot-reload manager.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("cell '{key}' already registered with type {existing}")]
    DuplicateKey { key: String, existing: &'static str },

    #[error("unknown cell '{key}'")]
    UnknownKey { key: String },

    #[error("type mismatch for cell '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("validator rejected write to cell '{key}'")]
    ValidationRejected { key: String },

    #[error("edge {dependent} <- {dependency} would close a dependency cycle")]
    CyclicDependency {
        dependent: String,
        dependency: String,
    },

    #[error("cell '{key}' is computed and rejects direct writes")]
    ComputedCellImmutable { key: String },

    #[error("history boundary reached for cell '{key}'")]
    HistoryBoundary { key: String },

    #[error("unknown command '{command}'")]
    UnknownCommand { command: String },

    #[error("command '{command}' rejected by interceptor")]
    RejectedByInterceptor { command: String },

    #[error("command '{command}' timed out after {timeout_ms} ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    #[error("command '{command}' was cancelled")]
    CommandCancelled { command: String },

    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("path cannot be watched: {path}")]
    PathInvalid { path: PathBuf },

    #[error("path is already watched: {path}")]
    DuplicateRegistration { path: PathBuf },

    #[error("watch backend failure for {path}: {message}")]
    BackendFailure { path: PathBuf, message: String },

    #[error("reload of {path} failed during {stage:?}: {message}")]
    ReloadFailed {
        stage: ReloadStage,
        path: PathBuf,
        message: String,
    },

    #[error("executor is shutting down")]
    ShuttingDown,

    #[error("io error on {path}: {error}")]
    IoError { path: String, error: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CoreError {
    /// Stable error code, safe to match on across versions.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::DuplicateKey { .. } => "state.duplicate_key",
            CoreError::UnknownKey { .. } => "state.unknown_key",
            CoreError::TypeMismatch { .. } => "state.type_mismatch",
            CoreError::ValidationRejected { .. } => "state.validation_rejected",
            CoreError::CyclicDependency { .. } => "state.cyclic_dependency",
            CoreError::ComputedCellImmutable { .. } => "state.computed_immutable",
            CoreError::HistoryBoundary { .. } => "state.history_boundary",
            CoreError::UnknownCommand { .. } => "command.unknown",
            CoreError::RejectedByInterceptor { .. } => "command.rejected",
            CoreError::CommandTimeout { .. } => "command.timeout",
            CoreError::CommandCancelled { .. } => "command.cancelled",
            CoreError::CommandFailed { .. } => "command.failed",
            CoreError::PathInvalid { .. } => "watch.path_invalid",
            CoreError::DuplicateRegistration { .. } => "watch.duplicate",
            CoreError::BackendFailure { .. } => "watch.backend",
            CoreError::ReloadFailed { stage, .. } => match stage {
                ReloadStage::Parse => "reload.parse",
                ReloadStage::Validate => "reload.validate",
                ReloadStage::Install => "reload.install",
                ReloadStage::Rollback => "reload.rollback",
            },
            CoreError::ShuttingDown => "executor.shutdown",
            CoreError::IoError { .. } => "core.io",
            CoreError::SerializationError { .. } => "core.serde",
            CoreError::Internal { .. } => "core.internal",
        }
    }

    /// Originating path for watcher and reload errors.
    pub fn path(&self) -> Option<&Path> {
        match self {
            CoreError::PathInvalid { path }
            | CoreError::DuplicateRegistration { path }
            | CoreError::BackendFailure { path, .. }
            | CoreError::ReloadFailed { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Originating command name for command errors.
    pub fn command(&self) -> Option<&str> {
        match self {
            CoreError::UnknownCommand { command }
            | CoreError::RejectedByInterceptor { command }
            | CoreError::CommandTimeout { command, .. }
            | CoreError::CommandCancelled { command }
            | CoreError::CommandFailed { command, .. } => Some(command),
            _ => None,
        }
    }
}

/// Create an io error tagged with the path it occurred on.
pub fn io_error(path: &Path, error: impl std::fmt::Display) -> CoreError {
    CoreError::IoError {
        path: path.to_string_lossy().to_string(),
        error: error.to_string(),
    }
}

/// Create a reload pipeline error for a given stage.
pub fn reload_error(stage: ReloadStage, path: &Path, error: impl std::fmt::Display) -> CoreError {
    CoreError::ReloadFailed {
        stage,
        path: path.to_path_buf(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = CoreError::UnknownKey {
            key: "volume".to_string(),
        };
        assert_eq!(err.code(), "state.unknown_key");

        let err = CoreError::ReloadFailed {
            stage: ReloadStage::Install,
            path: PathBuf::from("ui.json"),
            message: "boom".to_string(),
        };
        assert_eq!(err.code(), "reload.install");
        assert_eq!(err.path(), Some(Path::new("ui.json")));
    }

    #[test]
    fn test_command_errors_carry_origin() {
        let err = CoreError::CommandTimeout {
            command: "save".to_string(),
            timeout_ms: 5000,
        };
        assert_eq!(err.command(), Some("save"));
        assert!(err.path().is_none());
    }
}
