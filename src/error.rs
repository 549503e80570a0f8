//! Error taxonomy for builds and runs
//!
//! Every failure that belongs to a single build or run attempt is a
//! [`JudgeError`]. The execution layer converts the classifiable ones into
//! a [`TestCase`](crate::trace::TestCase) unless the caller asked for
//! raising behaviour.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Build failure with a human-readable diagnostic.
///
/// Cloneable so a failed [`BuildManager`](crate::build::BuildManager) can
/// re-report the same error on every later `build()` call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct BuildError {
    pub message: String,
}

impl BuildError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    #[error("build error: {0}")]
    Build(#[from] BuildError),

    #[error("not enough inputs: all {supplied} supplied inputs were consumed")]
    MissingInput { supplied: usize },

    #[error("{}", early_termination_message(.unused))]
    EarlyTermination { unused: Vec<String> },

    #[error("maximum execution time exceeded ({:.3}s)", .0.as_secs_f64())]
    Timeout(Duration),

    /// Uncaught error raised by the judged program itself.
    #[error("{0}")]
    Runtime(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Internal interaction failure that is not the program's fault.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("isolated worker failed: {0}")]
    Sandbox(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = JudgeError> = std::result::Result<T, E>;

/// Diagnostic listing the inputs a program never read.
pub fn early_termination_message(unused: &[String]) -> String {
    let mut message = String::from("Error: Process closed without consuming all inputs.");
    if !unused.is_empty() {
        message.push_str("\nUnused inputs:");
        for input in unused {
            message.push_str("\n    ");
            message.push_str(input);
        }
    }
    message
}

/// Serializable error kind used on the worker channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    UnknownLanguage,
    Build,
    MissingInput,
    EarlyTermination,
    Timeout,
    Runtime,
    IllegalState,
    Permission,
    Config,
    Protocol,
    Sandbox,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

/// Error as it travels from an isolated worker back to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unused: Vec<String>,
}

impl JudgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JudgeError::UnknownLanguage(_) => ErrorKind::UnknownLanguage,
            JudgeError::Build(_) => ErrorKind::Build,
            JudgeError::MissingInput { .. } => ErrorKind::MissingInput,
            JudgeError::EarlyTermination { .. } => ErrorKind::EarlyTermination,
            JudgeError::Timeout(_) => ErrorKind::Timeout,
            JudgeError::Runtime(_) => ErrorKind::Runtime,
            JudgeError::IllegalState(_) => ErrorKind::IllegalState,
            JudgeError::Permission(_) => ErrorKind::Permission,
            JudgeError::Config(_) => ErrorKind::Config,
            JudgeError::Protocol(_) => ErrorKind::Protocol,
            JudgeError::Sandbox(_) => ErrorKind::Sandbox,
            JudgeError::Io(_) => ErrorKind::Io,
        }
    }

    /// Errors that only concern the submitted program, as opposed to the
    /// judge's own configuration or plumbing.
    pub fn is_user_failure(&self) -> bool {
        matches!(
            self,
            JudgeError::Build(_)
                | JudgeError::MissingInput { .. }
                | JudgeError::EarlyTermination { .. }
                | JudgeError::Timeout(_)
                | JudgeError::Runtime(_)
        )
    }

    pub fn to_worker_error(&self) -> WorkerError {
        let (message, unused) = match self {
            JudgeError::Build(err) => (err.message.clone(), Vec::new()),
            JudgeError::UnknownLanguage(language) => (language.clone(), Vec::new()),
            JudgeError::EarlyTermination { unused } => (self.to_string(), unused.clone()),
            JudgeError::MissingInput { supplied } => (supplied.to_string(), Vec::new()),
            JudgeError::Timeout(limit) => (limit.as_millis().to_string(), Vec::new()),
            JudgeError::Runtime(message)
            | JudgeError::IllegalState(message)
            | JudgeError::Permission(message)
            | JudgeError::Config(message)
            | JudgeError::Protocol(message)
            | JudgeError::Sandbox(message) => (message.clone(), Vec::new()),
            JudgeError::Io(err) => (err.to_string(), Vec::new()),
        };
        WorkerError {
            kind: self.kind(),
            message,
            unused,
        }
    }
}

impl From<WorkerError> for JudgeError {
    fn from(err: WorkerError) -> Self {
        let WorkerError {
            kind,
            message,
            unused,
        } = err;
        match kind {
            ErrorKind::UnknownLanguage => JudgeError::UnknownLanguage(message),
            ErrorKind::Build => JudgeError::Build(BuildError::new(message)),
            ErrorKind::MissingInput => JudgeError::MissingInput {
                supplied: message.parse().unwrap_or_default(),
            },
            ErrorKind::EarlyTermination => JudgeError::EarlyTermination { unused },
            ErrorKind::Timeout => JudgeError::Timeout(Duration::from_millis(
                message.parse().unwrap_or_default(),
            )),
            ErrorKind::Runtime => JudgeError::Runtime(message),
            ErrorKind::IllegalState => JudgeError::IllegalState(message),
            ErrorKind::Permission => JudgeError::Permission(message),
            ErrorKind::Config => JudgeError::Config(message),
            ErrorKind::Protocol => JudgeError::Protocol(message),
            ErrorKind::Sandbox | ErrorKind::Io => JudgeError::Sandbox(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_termination_lists_unused_inputs() {
        let err = JudgeError::EarlyTermination {
            unused: vec!["b".to_string(), "c".to_string()],
        };
        let text = err.to_string();
        assert!(text.starts_with("Error: Process closed without consuming all inputs."));
        assert!(text.ends_with("Unused inputs:\n    b\n    c"));
    }

    #[test]
    fn test_worker_error_round_trip_keeps_kind() {
        let cases = vec![
            JudgeError::Build(BuildError::new("syntax error")),
            JudgeError::Timeout(Duration::from_millis(250)),
            JudgeError::EarlyTermination {
                unused: vec!["x".to_string()],
            },
            JudgeError::UnknownLanguage("brainfuck".to_string()),
        ];
        for err in cases {
            let wire = serde_json::to_string(&err.to_worker_error()).unwrap();
            let back: WorkerError = serde_json::from_str(&wire).unwrap();
            let restored = JudgeError::from(back);
            assert_eq!(restored.kind(), err.kind());
            assert_eq!(restored.to_string(), err.to_string());
        }
    }

    #[test]
    fn test_user_failures() {
        assert!(JudgeError::Runtime("boom".into()).is_user_failure());
        assert!(!JudgeError::Config("bad".into()).is_user_failure());
        assert!(!JudgeError::Permission("nope".into()).is_user_failure());
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::EarlyTermination.to_string(), "early-termination");
        assert_eq!(ErrorKind::Build.to_string(), "build");
    }
}
