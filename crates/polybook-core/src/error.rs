//! Error types for polybook-core.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for polybook-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in polybook-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The compile step exited non-zero. Execution never started.
    #[error("compilation failed ({language}):\n{diagnostics}")]
    CompileFailure {
        language: String,
        diagnostics: String,
    },

    /// The program exited non-zero.
    #[error("{detail}")]
    RuntimeFailure { detail: String },

    /// A cancellation signal was observed before natural completion.
    #[error("execution cancelled")]
    Cancelled,

    /// The persistent interpreter was interrupted and its state discarded.
    #[error("execution interrupted")]
    Interrupted,

    /// The interpreter did not announce readiness in time.
    #[error("timed out after {timeout:?} waiting for interpreter '{program}' to start")]
    StartupTimeout { program: String, timeout: Duration },

    /// A subprocess could not be launched.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The interpreter process went away while an execution was in flight.
    #[error("interpreter exited unexpectedly{}", status.as_ref().map(|s| format!(" ({s})")).unwrap_or_default())]
    InterpreterExited { status: Option<String> },

    /// The session was disposed while the execution was pending.
    #[error("interpreter session disposed")]
    SessionDisposed,

    /// No runner is known for the language tag.
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable tag for an [`Error`], used in wire reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    CompileFailure,
    RuntimeFailure,
    Cancelled,
    Interrupted,
    StartupTimeout,
    Spawn,
    InterpreterExited,
    SessionDisposed,
    UnsupportedLanguage,
    Config,
    Io,
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CompileFailure { .. } => ErrorKind::CompileFailure,
            Error::RuntimeFailure { .. } => ErrorKind::RuntimeFailure,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::StartupTimeout { .. } => ErrorKind::StartupTimeout,
            Error::Spawn { .. } => ErrorKind::Spawn,
            Error::InterpreterExited { .. } => ErrorKind::InterpreterExited,
            Error::SessionDisposed => ErrorKind::SessionDisposed,
            Error::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the execution was stopped on request rather than failing.
    ///
    /// Callers render these as "stopped" instead of "error".
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            Error::Cancelled | Error::Interrupted | Error::SessionDisposed
        )
    }

    /// Recovery hint for the user, if there is one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::StartupTimeout { .. } => {
                Some("check the configured python path (`python` in config.json or POLYBOOK_PYTHON)")
            }
            Error::Spawn { .. } => {
                Some("make sure the toolchain is installed and the configured path is correct")
            }
            Error::Interrupted => Some("interpreter state was reset; re-run earlier cells"),
            _ => None,
        }
    }

    /// Format the error with its hint appended.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{self}\n  hint: {hint}"),
            None => self.to_string(),
        }
    }
}
