//! Command outcome types.
//!
//! A completed command resolves to either a plain [`CommandReport`] or, when
//! a done-callback was supplied, to whatever value the callback produced.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ShellError;

/// Boxed future used by deferred init scripts and done-callbacks.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Callback invoked with the finished command's report and the opaque payload
/// supplied at submission. Its (possibly deferred) return value becomes the
/// resolved value of the command's completion handle.
pub type DoneCallback = Arc<dyn Fn(CommandReport, Option<Value>) -> BoxFuture<Value> + Send + Sync>;

/// The default resolved value of a completed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReport {
    /// `Some(ShellError::NonZeroStatus)` when the exit-status probe reported
    /// failure, `None` otherwise.
    pub error: Option<ShellError>,
    /// The command text as submitted (without the engine's trailer).
    pub command: String,
    /// Everything the command wrote to the captured stream.
    pub output: String,
}

impl CommandReport {
    /// Whether the command completed without error.
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Resolved value of a command's completion handle.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Plain `{error, command, output}` record.
    Report(CommandReport),
    /// Value returned by a caller-supplied done-callback.
    Custom(Value),
}

impl CommandResult {
    /// The report, when no callback overrode the resolved value.
    pub fn into_report(self) -> Option<CommandReport> {
        match self {
            Self::Report(report) => Some(report),
            Self::Custom(_) => None,
        }
    }

    /// The captured output, when the result is a plain report.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Report(report) => Some(&report.output),
            Self::Custom(_) => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn report_success_flag() {
        let ok = CommandReport {
            error: None,
            command: "printf HELLO;".into(),
            output: "HELLO".into(),
        };
        assert!(ok.is_success());

        let failed = CommandReport {
            error: Some(ShellError::NonZeroStatus),
            command: "false;".into(),
            output: String::new(),
        };
        assert!(!failed.is_success());
    }

    #[test]
    fn result_accessors() {
        let report = CommandReport {
            error: None,
            command: "pwd;".into(),
            output: "/\n".into(),
        };
        let result = CommandResult::Report(report.clone());
        assert_eq!(result.output(), Some("/\n"));
        assert_eq!(result.into_report(), Some(report));

        let custom = CommandResult::Custom(serde_json::json!({"done": true}));
        assert_eq!(custom.output(), None);
        assert_eq!(custom.into_report(), None);
    }
}
